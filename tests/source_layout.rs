// tests/source_layout.rs
//
// Source files stay within the 100-column width the rest of the crate is
// formatted to.

use std::fs;
use std::path::{Path, PathBuf};

const MAX_WIDTH: usize = 100;

fn rust_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            rust_files(&path, out);
        } else if path.extension().is_some_and(|e| e == "rs") {
            out.push(path);
        }
    }
}

#[test]
fn no_line_exceeds_max_width() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    rust_files(&root.join("src"), &mut files);
    rust_files(&root.join("tests"), &mut files);
    assert!(!files.is_empty());

    let mut long = Vec::new();
    for file in &files {
        let content = fs::read_to_string(file).expect("read source file");
        for (n, line) in content.lines().enumerate() {
            let width = line.chars().count();
            if width > MAX_WIDTH {
                long.push(format!("{}:{} ({width})", file.display(), n + 1));
            }
        }
    }
    assert!(long.is_empty(), "lines over {MAX_WIDTH} columns:\n{}", long.join("\n"));
}
