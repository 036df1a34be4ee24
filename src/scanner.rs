//! Repository scanner.
//!
//! Walks the source tree with `ignore` (honoring `.gitignore` unless
//! disabled), filters relative paths through include/exclude glob sets,
//! skips oversized and binary files, and tags
//! each file with a coarse [`FileType`] and zero or more domain tags.
//! Files carrying an infrastructure domain are reclassified as
//! [`FileType::Infra`].

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

use crate::config::ScanConfig;
use crate::models::{FileType, ScannedFile};

const DEFAULT_EXCLUDES: [&str; 14] = [
    "**/.git/**",
    "**/target/**",
    "**/node_modules/**",
    "**/.venv/**",
    "**/venv/**",
    "**/dist/**",
    "**/build/**",
    "**/.idea/**",
    "**/.vscode/**",
    "**/__pycache__/**",
    "**/.pytest_cache/**",
    "**/.mypy_cache/**",
    "**/site/**",
    "**/.doc-harness-cache/**",
];

const CODE_EXTENSIONS: [&str; 23] = [
    "py", "pyi", "pyx", "js", "jsx", "ts", "tsx", "go", "java", "c", "cc", "cpp", "h", "hpp",
    "rs", "rb", "php", "cs", "kt", "kts", "swift", "m", "mm",
];
const DOC_EXTENSIONS: [&str; 4] = ["md", "rst", "adoc", "txt"];
const CONFIG_EXTENSIONS: [&str; 9] = [
    "yml", "yaml", "json", "toml", "ini", "cfg", "conf", "env", "properties",
];
const DATA_EXTENSIONS: [&str; 5] = ["csv", "tsv", "parquet", "avro", "jsonl"];
const TERRAFORM_EXTENSIONS: [&str; 2] = ["tf", "tfvars"];

const K8S_FILENAMES: [&str; 8] = [
    "deployment.yaml",
    "deployment.yml",
    "service.yaml",
    "service.yml",
    "ingress.yaml",
    "ingress.yml",
    "kustomization.yaml",
    "kustomization.yml",
];
const CI_FILENAMES: [&str; 3] = [".gitlab-ci.yml", "Jenkinsfile", "azure-pipelines.yml"];
const HELM_FILENAMES: [&str; 4] = ["Chart.yaml", "Chart.yml", "values.yaml", "values.yml"];
const DOCKER_FILENAMES: [&str; 5] = [
    "Dockerfile",
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yaml",
    "compose.yml",
];
const INFRA_DOMAINS: [&str; 6] = ["kubernetes", "helm", "terraform", "ansible", "docker", "ci"];

/// Bytes inspected for NUL when detecting binary files.
const BINARY_SAMPLE: usize = 2048;
/// Content prefix inspected by domain detection.
const DOMAIN_SNIPPET: usize = 4000;

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn split_name(path: &str) -> (&str, String) {
    let name = path.rsplit('/').next().unwrap_or(path);
    let ext = match name.rfind('.') {
        Some(i) if i > 0 => name[i + 1..].to_lowercase(),
        _ => String::new(),
    };
    (name, ext)
}

/// Coarse type from the file name and extension.
pub fn classify_type(path: &str) -> FileType {
    let (name, ext) = split_name(path);
    let ext = ext.as_str();
    if DOCKER_FILENAMES.contains(&name) || name.starts_with("Dockerfile") {
        return FileType::Infra;
    }
    if CI_FILENAMES.contains(&name) || path.contains(".github/workflows") {
        return FileType::Ci;
    }
    if TERRAFORM_EXTENSIONS.contains(&ext) {
        return FileType::Infra;
    }
    if CODE_EXTENSIONS.contains(&ext) {
        FileType::Code
    } else if DOC_EXTENSIONS.contains(&ext) {
        FileType::Docs
    } else if CONFIG_EXTENSIONS.contains(&ext) {
        FileType::Config
    } else if DATA_EXTENSIONS.contains(&ext) {
        FileType::Data
    } else {
        FileType::Other
    }
}

/// Domain tags from the path and a prefix of the content.
pub fn detect_domains(path: &str, snippet: &str) -> BTreeSet<String> {
    let (name, ext) = split_name(path);
    let yaml = ext == "yml" || ext == "yaml";
    let mut domains = BTreeSet::new();
    let mut tag = |d: &str| {
        domains.insert(d.to_string());
    };

    if DOCKER_FILENAMES.contains(&name) || name.starts_with("Dockerfile") {
        tag("docker");
    }
    if path.contains("docker") && (yaml || name.starts_with("Dockerfile")) {
        tag("docker");
    }
    if CI_FILENAMES.contains(&name) || path.contains(".github/workflows") {
        tag("ci");
    }
    if HELM_FILENAMES.contains(&name) || path.contains("charts/") || path.contains("/templates/") {
        tag("helm");
    }
    if TERRAFORM_EXTENSIONS.contains(&ext.as_str()) || path.contains("terraform") {
        tag("terraform");
    }
    if path.contains("ansible") || path.contains("/roles/") || path.contains("/tasks/") {
        tag("ansible");
    }
    if K8S_FILENAMES.contains(&name) || path.contains("k8s") || path.contains("kubernetes") {
        tag("kubernetes");
    }
    if yaml && snippet.contains("apiVersion") && snippet.contains("kind") {
        tag("kubernetes");
    }
    domains
}

fn is_infra(domains: &BTreeSet<String>) -> bool {
    domains.iter().any(|d| INFRA_DOMAINS.contains(&d.as_str()))
}

fn looks_binary(path: &Path) -> bool {
    let mut sample = [0u8; BINARY_SAMPLE];
    match std::fs::File::open(path).and_then(|mut f| f.read(&mut sample)) {
        Ok(n) => sample[..n].contains(&0),
        Err(_) => true,
    }
}

fn snippet(content: &str) -> &str {
    let mut end = content.len().min(DOMAIN_SNIPPET);
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

/// Scan `root`, returning files sorted by relative path.
///
/// `extra_excludes` are added to the configured and default excludes
/// (the output and cache directories when they live inside the tree).
pub fn scan_repository(
    root: &Path,
    config: &ScanConfig,
    extra_excludes: &[String],
) -> Result<Vec<ScannedFile>> {
    if !root.is_dir() {
        bail!("Source root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(config.exclude_globs.iter().cloned());
    excludes.extend(extra_excludes.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    // Hidden files stay in: CI workflows and `.env` files live there.
    let mut walker = WalkBuilder::new(root);
    walker
        .follow_links(config.follow_symlinks)
        .hidden(false)
        .parents(false)
        .ignore(false)
        .git_global(false)
        .git_ignore(config.respect_gitignore)
        .git_exclude(config.respect_gitignore)
        .require_git(false);

    let mut files = Vec::new();
    for entry in walker.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&rel) || !include_set.is_match(&rel) {
            continue;
        }

        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(_) => continue,
        };
        if config.max_file_bytes > 0 && size > config.max_file_bytes {
            tracing::debug!(path = %rel, size, "skipping oversized file");
            continue;
        }
        if looks_binary(path) {
            tracing::debug!(path = %rel, "skipping binary file");
            continue;
        }

        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %rel, "skipping unreadable file: {}", e);
                continue;
            }
        };
        let content = String::from_utf8_lossy(&bytes).into_owned();
        let domains = detect_domains(&rel, snippet(&content));
        let file_type = if is_infra(&domains) {
            FileType::Infra
        } else {
            classify_type(&rel)
        };

        files.push(ScannedFile {
            path: rel,
            content,
            size,
            file_type,
            domains,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn classifies_by_name_and_extension() {
        assert_eq!(classify_type("src/app.py"), FileType::Code);
        assert_eq!(classify_type("README.md"), FileType::Docs);
        assert_eq!(classify_type("conf/app.TOML"), FileType::Config);
        assert_eq!(classify_type("data/rows.csv"), FileType::Data);
        assert_eq!(classify_type("Dockerfile.dev"), FileType::Infra);
        assert_eq!(classify_type(".github/workflows/ci.yml"), FileType::Ci);
        assert_eq!(classify_type("main.tf"), FileType::Infra);
        assert_eq!(classify_type("LICENSE"), FileType::Other);
    }

    #[test]
    fn detects_domains() {
        let k8s = detect_domains("deploy/app.yaml", "apiVersion: v1\nkind: Service\n");
        assert!(k8s.contains("kubernetes"));
        assert!(detect_domains("charts/api/values.yaml", "").contains("helm"));
        assert!(detect_domains("docker-compose.yml", "").contains("docker"));
        assert!(detect_domains("infra/terraform/main.tf", "").contains("terraform"));
        assert!(detect_domains("src/app.py", "kind apiVersion").is_empty());
    }

    #[test]
    fn scans_with_filters() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::create_dir_all(root.join(".ai-docs")).unwrap();
        fs::write(root.join("src/app.py"), "print('hi')\n").unwrap();
        fs::write(root.join("b.yaml"), "apiVersion: apps/v1\nkind: Deployment\n").unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), "x").unwrap();
        fs::write(root.join(".ai-docs/index.md"), "# Docs").unwrap();
        fs::write(root.join("blob.txt"), b"ab\0cd").unwrap();
        fs::write(root.join("big.md"), "x".repeat(64)).unwrap();

        let config = ScanConfig {
            max_file_bytes: 48,
            ..ScanConfig::default()
        };
        let files = scan_repository(root, &config, &["**/.ai-docs/**".to_string()]).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["b.yaml", "src/app.py"]);
        assert_eq!(files[0].file_type, FileType::Infra);
        assert!(files[0].domains.contains("kubernetes"));
        assert_eq!(files[1].file_type, FileType::Code);
    }

    #[test]
    fn gitignored_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("generated")).unwrap();
        fs::create_dir_all(root.join(".github/workflows")).unwrap();
        fs::write(root.join(".gitignore"), "ignored.txt\ngenerated/\n").unwrap();
        fs::write(root.join("kept.txt"), "kept\n").unwrap();
        fs::write(root.join("ignored.txt"), "ignored\n").unwrap();
        fs::write(root.join("generated/api.py"), "x = 1\n").unwrap();
        fs::write(root.join(".github/workflows/ci.yml"), "on: push\n").unwrap();

        let files = scan_repository(root, &ScanConfig::default(), &[]).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec![".github/workflows/ci.yml", "kept.txt"]);

        let config = ScanConfig {
            respect_gitignore: false,
            ..ScanConfig::default()
        };
        let files = scan_repository(root, &config, &[]).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![".github/workflows/ci.yml", "generated/api.py", "ignored.txt", "kept.txt"]
        );
    }

    #[test]
    fn missing_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_repository(&dir.path().join("nope"), &ScanConfig::default(), &[]).is_err());
    }
}
