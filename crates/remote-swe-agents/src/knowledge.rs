//! Repository knowledge: agent instructions checked into the working tree
//! and appended to the system prompt.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

/// Single files, in priority order. The first one present wins.
const KNOWLEDGE_FILES: &[&str] = &[
    ".cursorrules",
    ".github/copilot-instructions.md",
    "AGENT.md",
    "AGENTS.md",
];

/// Directory whose markdown files are concatenated when no single file exists.
const KNOWLEDGE_DIR: &str = ".cursor/rules";

/// Read the knowledge for the repository at `repo`, if it has any.
pub async fn find_repository_knowledge(repo: &Path) -> Option<String> {
    for name in KNOWLEDGE_FILES {
        let path = repo.join(name);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            continue;
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                info!("found knowledge file {name} in {}", repo.display());
                return Some(content);
            }
            Err(e) => warn!("failed to read knowledge file {}: {e}", path.display()),
        }
    }

    let files = markdown_files(&repo.join(KNOWLEDGE_DIR)).await;
    if files.is_empty() {
        debug!("no repository knowledge in {}", repo.display());
        return None;
    }
    info!(
        "found knowledge directory {KNOWLEDGE_DIR} with {} markdown file(s)",
        files.len()
    );

    let mut knowledge = String::new();
    let mut found = false;
    for file in files {
        match tokio::fs::read_to_string(&file).await {
            Ok(content) => {
                let relative = file.strip_prefix(repo).unwrap_or(&file);
                knowledge.push_str(&format!(
                    "\n\n# /{}\n{content}",
                    relative.to_string_lossy().replace('\\', "/")
                ));
                found = true;
            }
            Err(e) => warn!("failed to read knowledge file {}: {e}", file.display()),
        }
    }
    found.then_some(knowledge)
}

/// All `*.md` files under `dir`, recursively, in path order.
async fn markdown_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) => {
                if current != dir {
                    warn!("failed to read {}: {e}", current.display());
                }
                continue;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("failed to list {}: {e}", current.display());
                    break;
                }
            };
            let path = entry.path();
            match entry.file_type().await {
                Ok(kind) if kind.is_dir() => pending.push(path),
                Ok(_) => {
                    let is_markdown = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("md"));
                    if is_markdown {
                        found.push(path);
                    }
                }
                Err(e) => warn!("failed to stat {}: {e}", path.display()),
            }
        }
    }
    found.sort();
    found
}

/// The base prompt, extended with a `## Repository Knowledge` section when
/// `knowledge` is present.
pub fn system_prompt_with_knowledge(base: &str, knowledge: Option<&str>) -> String {
    match knowledge {
        Some(knowledge) => format!("{base}\n## Repository Knowledge\n{knowledge}"),
        None => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn agents_md_is_used() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("AGENTS.md"), "Run `make test` before committing.")
            .expect("write");

        let knowledge = find_repository_knowledge(dir.path()).await;
        assert_eq!(knowledge.as_deref(), Some("Run `make test` before committing."));

        let prompt = system_prompt_with_knowledge("base", knowledge.as_deref());
        assert_eq!(
            prompt,
            "base\n## Repository Knowledge\nRun `make test` before committing."
        );
    }

    #[tokio::test]
    async fn first_file_in_priority_order_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(".cursorrules"), "cursor rules").expect("write");
        std::fs::write(dir.path().join("AGENTS.md"), "agents").expect("write");

        let knowledge = find_repository_knowledge(dir.path()).await;
        assert_eq!(knowledge.as_deref(), Some("cursor rules"));
    }

    #[tokio::test]
    async fn rules_directory_is_concatenated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rules = dir.path().join(".cursor/rules/nested");
        std::fs::create_dir_all(&rules).expect("mkdir");
        std::fs::write(dir.path().join(".cursor/rules/a.md"), "alpha").expect("write");
        std::fs::write(rules.join("b.MD"), "beta").expect("write");
        std::fs::write(dir.path().join(".cursor/rules/ignored.txt"), "nope").expect("write");

        let knowledge = find_repository_knowledge(dir.path())
            .await
            .expect("knowledge");
        assert_eq!(
            knowledge,
            "\n\n# /.cursor/rules/a.md\nalpha\n\n# /.cursor/rules/nested/b.MD\nbeta"
        );
    }

    #[tokio::test]
    async fn bare_repository_has_no_knowledge() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(find_repository_knowledge(dir.path()).await.is_none());
        assert_eq!(system_prompt_with_knowledge("base", None), "base");
    }
}
