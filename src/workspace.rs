use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const APP_DIR_NAME: &str = ".mission-agent";
const SCRIPT_RUNTIME_MARKERS: &[&str] = &["package.json", "package-lock.json", "node_modules"];

/// Locations under the user's home directory that belong to this tool.
#[derive(Debug, Clone)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    pub fn from_home() -> Result<Self> {
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .context("cannot resolve home directory (HOME / USERPROFILE unset)")?;
        Ok(Self::with_root(home.join(APP_DIR_NAME)))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn workspace(&self) -> PathBuf {
        self.root.join("workspace")
    }

    pub fn scratch_source(&self) -> PathBuf {
        self.workspace().join(".tempwork").join("data")
    }

    pub fn scratch_output(&self) -> PathBuf {
        self.workspace().join(".tempwork").join("output")
    }

    pub fn ensure_workspace(&self) -> Result<PathBuf> {
        let workspace = self.workspace();
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("failed creating workspace {}", workspace.display()))?;
        Ok(workspace)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathValidationError {
    pub label: String,
    pub path: String,
    pub forbidden: Vec<char>,
}

impl fmt::Display for PathValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listed = self
            .forbidden
            .iter()
            .map(|c| format!("{c:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "{} `{}` must not contain any of: {listed}",
            self.label, self.path
        )
    }
}

impl std::error::Error for PathValidationError {}

fn forbidden_path_chars() -> Vec<char> {
    if cfg!(windows) {
        vec!['"', '\'']
    } else {
        vec!['"', '\'', ' ']
    }
}

/// Paths are later interpolated into sandbox shell commands, so quoting
/// characters (and spaces outside Windows) are refused up front.
pub fn validate_path(path: &str, label: &str) -> Result<(), PathValidationError> {
    let forbidden = forbidden_path_chars();
    if path.chars().any(|c| forbidden.contains(&c)) {
        return Err(PathValidationError {
            label: label.to_owned(),
            path: path.to_owned(),
            forbidden,
        });
    }
    Ok(())
}

pub fn absolutize(raw: &str) -> Result<PathBuf> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().context("failed resolving current directory")?;
    Ok(cwd.join(path))
}

/// Returns the mission text: the contents of `raw` flattened to one line when
/// it names an existing file, otherwise `raw` itself.
pub fn resolve_mission_text(raw: &str) -> Result<String> {
    let candidate = absolutize(raw)?;
    if !candidate.is_file() {
        return Ok(raw.to_owned());
    }
    let text = std::fs::read_to_string(&candidate)
        .with_context(|| format!("failed reading mission file {}", candidate.display()))?;
    Ok(flatten_lines(&text))
}

pub fn flatten_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn validate_source_dir(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("data source path does not exist: {}", path.display()))?;
    if !metadata.is_dir() {
        anyhow::bail!("data source path is not a directory: {}", path.display());
    }
    for marker in SCRIPT_RUNTIME_MARKERS {
        if path.join(marker).exists() {
            anyhow::bail!(
                "data source path must not contain script-runtime bookkeeping ({marker}): {}",
                path.display()
            );
        }
    }
    Ok(())
}

/// Picks a directory name based on `base`. Without `overwrite`, `_1`, `_2`, ...
/// are appended until a free name is found; with `overwrite`, anything at
/// `base` is removed. The directory is created unless `create` is false.
pub fn prepare_output_dir(base: &Path, overwrite: bool, create: bool) -> Result<PathBuf> {
    let base_text = base.to_string_lossy();
    let trimmed = base_text.trim_end_matches(['/', '\\']);
    let base = if trimmed.is_empty() {
        base.to_path_buf()
    } else {
        PathBuf::from(trimmed)
    };

    let target = if overwrite {
        match std::fs::remove_dir_all(&base) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed clearing {}", base.display()))
            }
        }
        base
    } else {
        let mut target = base.clone();
        let mut suffix = 1usize;
        while target.exists() {
            target = PathBuf::from(format!("{}_{suffix}", base.display()));
            suffix += 1;
        }
        target
    };

    if create {
        std::fs::create_dir_all(&target)
            .with_context(|| format!("failed creating {}", target.display()))?;
    }
    Ok(target)
}

/// Removes each directory that exists and is empty; errors are ignored.
pub fn remove_if_empty(dirs: &[&Path]) {
    for dir in dirs {
        let is_empty = std::fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty {
            let _ = std::fs::remove_dir(dir);
        }
    }
}

/// Moves a directory, falling back to copy + remove when a plain rename is
/// not possible (different filesystems).
pub fn move_dir(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir_recursive(from, to)
                .with_context(|| format!("failed copying {} to {}", from.display(), to.display()))?;
            std::fs::remove_dir_all(from)
                .with_context(|| format!("failed removing {}", from.display()))
        }
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "mission-agent-workspace-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&path);
        path
    }

    #[test]
    fn validate_path_rejects_quotes() {
        assert!(validate_path("/tmp/data", "source").is_ok());
        let err = validate_path("/tmp/da\"ta", "source").expect_err("quote");
        assert!(err.to_string().contains("source"));
        assert!(validate_path("/tmp/it's", "output").is_err());
        if !cfg!(windows) {
            assert!(validate_path("/tmp/my data", "output").is_err());
        }
    }

    #[test]
    fn flatten_lines_drops_blank_lines_and_joins_with_spaces() {
        let text = "make three folders\n\n   \nnamed folder_0, folder_1\nand folder_2\n";
        assert_eq!(
            flatten_lines(text),
            "make three folders named folder_0, folder_1 and folder_2"
        );
    }

    #[test]
    fn resolve_mission_text_reads_existing_file() {
        let dir = temp_path("mission");
        std::fs::create_dir_all(&dir).expect("mkdir");
        let file = dir.join("mission.txt");
        std::fs::write(&file, "line one\n\nline two\n").expect("write");
        let text = resolve_mission_text(&file.to_string_lossy()).expect("mission");
        assert_eq!(text, "line one line two");
        assert_eq!(
            resolve_mission_text("just do it").expect("literal"),
            "just do it"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn prepare_output_dir_suffixes_taken_names() {
        let base = temp_path("prepare");
        let first = prepare_output_dir(&base, false, true).expect("first");
        assert_eq!(first, base);
        let second = prepare_output_dir(&base, false, true).expect("second");
        assert_eq!(second, PathBuf::from(format!("{}_1", base.display())));
        let third = prepare_output_dir(&base, false, false).expect("third");
        assert_eq!(third, PathBuf::from(format!("{}_2", base.display())));
        assert!(!third.exists());

        std::fs::write(base.join("old.txt"), "old").expect("write");
        let replaced = prepare_output_dir(&base, true, true).expect("overwrite");
        assert_eq!(replaced, base);
        assert!(!base.join("old.txt").exists());

        let _ = std::fs::remove_dir_all(&base);
        let _ = std::fs::remove_dir_all(&second);
    }

    #[test]
    fn validate_source_dir_rejects_runtime_bookkeeping() {
        let dir = temp_path("source");
        assert!(validate_source_dir(&dir).is_err());
        std::fs::create_dir_all(&dir).expect("mkdir");
        assert!(validate_source_dir(&dir).is_ok());
        std::fs::write(dir.join("package.json"), "{}").expect("write");
        let err = validate_source_dir(&dir).expect_err("bookkeeping");
        assert!(err.to_string().contains("package.json"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn move_dir_relocates_tree_and_remove_if_empty_keeps_full_dirs() {
        let root = temp_path("move");
        let from = root.join("from");
        std::fs::create_dir_all(from.join("nested")).expect("mkdir");
        std::fs::write(from.join("nested/a.txt"), "a").expect("write");
        let to = root.join("to");
        move_dir(&from, &to).expect("move");
        assert!(!from.exists());
        assert_eq!(
            std::fs::read_to_string(to.join("nested/a.txt")).expect("read"),
            "a"
        );

        let empty = root.join("empty");
        std::fs::create_dir_all(&empty).expect("mkdir");
        remove_if_empty(&[&empty, &to]);
        assert!(!empty.exists());
        assert!(to.exists());
        let _ = std::fs::remove_dir_all(&root);
    }
}
