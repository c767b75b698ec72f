use std::env;
use std::fs;
use std::path::Path;

fn main() {
    let out_dir = env::var("OUT_DIR").unwrap();

    // Crate docs are assembled from the READMEs, minus any frontmatter
    let readmes = [
        ("README.md", "README.md"),
        ("src/crdt/README.md", "crdt_README.md"),
        ("src/render/README.md", "render_README.md"),
    ];

    for (src, dest) in readmes {
        println!("cargo:rerun-if-changed={}", src);
        let content = fs::read_to_string(src).unwrap_or_default();
        let body = strip_frontmatter(&content);
        fs::write(Path::new(&out_dir).join(dest), body)
            .unwrap_or_else(|_| panic!("Failed to write {}", dest));
    }
}

/// Strip YAML frontmatter (content between --- delimiters)
fn strip_frontmatter(content: &str) -> &str {
    if let Some(stripped) = content.strip_prefix("---")
        && let Some(end) = stripped.find("\n---")
    {
        return stripped[end + 4..].trim_start();
    }
    content
}
