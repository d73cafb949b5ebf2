use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

pub const EMBEDDED_CHUNK_SIZE: usize = 1024 * 1024;
pub const CONTAINER_CHUNK_SIZE: usize = 10 * 1024 * 1024;

pub const CHUNK_PREFIX: &str = "data_";
pub const CHUNK_SUFFIX: &str = ".base64.chunked";
/// Files the agent itself writes into a sandbox carry this prefix.
pub const INTERNAL_FILE_PREFIX: &str = "agent-data-handling-";

const BOOKKEEPING_NAMES: &[&str] = &[
    "node_modules",
    ".git",
    ".vscode",
    "package.json",
    "package-lock.json",
];

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorCode {
    Io,
    Archive,
    Encoding,
    MissingChunk,
}

impl TransferErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Io => "io_error",
            Self::Archive => "archive_error",
            Self::Encoding => "encoding_error",
            Self::MissingChunk => "missing_chunk",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferError {
    pub code: TransferErrorCode,
    pub message: String,
}

impl TransferError {
    pub(crate) fn new(code: TransferErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(context: impl fmt::Display, err: io::Error) -> Self {
        Self::new(TransferErrorCode::Io, format!("{context}: {err}"))
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for TransferError {}

pub type TransferResult<T> = Result<T, TransferError>;

/// One base64 block of an archive. The position is encoded in the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub name: String,
    pub data: String,
}

impl Chunk {
    pub fn name_for(index: usize) -> String {
        format!("{CHUNK_PREFIX}{index}{CHUNK_SUFFIX}")
    }

    pub fn index(&self) -> Option<usize> {
        chunk_index(&self.name)
    }
}

pub fn chunk_index(name: &str) -> Option<usize> {
    name.strip_prefix(CHUNK_PREFIX)?
        .strip_suffix(CHUNK_SUFFIX)?
        .parse()
        .ok()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkSet {
    pub chunks: Vec<Chunk>,
}

impl ChunkSet {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks sorted by their encoded position. Fails on unparseable names
    /// and on gaps in the sequence.
    pub fn ordered(&self) -> TransferResult<Vec<&Chunk>> {
        let mut indexed = self
            .chunks
            .iter()
            .map(|chunk| {
                chunk.index().map(|index| (index, chunk)).ok_or_else(|| {
                    TransferError::new(
                        TransferErrorCode::MissingChunk,
                        format!("chunk name `{}` does not encode a position", chunk.name),
                    )
                })
            })
            .collect::<TransferResult<Vec<_>>>()?;
        indexed.sort_by_key(|(index, _)| *index);
        for (expected, (index, _)) in indexed.iter().enumerate() {
            if *index != expected {
                return Err(TransferError::new(
                    TransferErrorCode::MissingChunk,
                    format!("chunk {expected} is missing"),
                ));
            }
        }
        Ok(indexed.into_iter().map(|(_, chunk)| chunk).collect())
    }

    pub fn write_to_dir(&self, dir: &Path) -> TransferResult<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)
            .map_err(|err| TransferError::io(format!("creating {}", dir.display()), err))?;
        self.chunks
            .iter()
            .map(|chunk| {
                let path = dir.join(&chunk.name);
                std::fs::write(&path, &chunk.data)
                    .map_err(|err| TransferError::io(format!("writing {}", path.display()), err))?;
                Ok(path)
            })
            .collect()
    }

    /// Collects every `data_N.base64.chunked` file in `dir`.
    pub fn read_from_dir(dir: &Path) -> TransferResult<Self> {
        let entries = std::fs::read_dir(dir)
            .map_err(|err| TransferError::io(format!("reading {}", dir.display()), err))?;
        let mut chunks = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| TransferError::io(format!("reading {}", dir.display()), err))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if chunk_index(&name).is_none() {
                continue;
            }
            let data = std::fs::read_to_string(entry.path())
                .map_err(|err| TransferError::io(format!("reading chunk {name}"), err))?;
            chunks.push(Chunk { name, data });
        }
        Ok(Self { chunks })
    }
}

/// Deletes the wrapped path when dropped, so temporary archives and
/// scratch directories disappear on every exit path.
pub(crate) struct ScratchPath(PathBuf);

impl ScratchPath {
    pub(crate) fn new(parent: &Path, tag: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let counter = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(parent.join(format!(
            ".{INTERNAL_FILE_PREFIX}{tag}-{}-{nanos}-{counter}",
            std::process::id()
        )))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchPath {
    fn drop(&mut self) {
        if self.0.is_dir() {
            let _ = std::fs::remove_dir_all(&self.0);
        } else {
            let _ = std::fs::remove_file(&self.0);
        }
    }
}

/// Archives `folder` (keeping its own name as the top-level entry), then
/// slices the archive into `chunk_size` windows, each base64-encoded on its
/// own.
pub fn serialize_folder(folder: &Path, chunk_size: usize) -> TransferResult<ChunkSet> {
    if chunk_size == 0 {
        return Err(TransferError::new(
            TransferErrorCode::Archive,
            "chunk size must be > 0",
        ));
    }
    if !folder.is_dir() {
        return Err(TransferError::new(
            TransferErrorCode::Io,
            format!("{} is not a directory", folder.display()),
        ));
    }
    let root_name = folder
        .file_name()
        .map(|name| name.to_owned())
        .unwrap_or_else(|| "data".into());

    let archive = ScratchPath::new(&std::env::temp_dir(), "archive");
    {
        let file = File::create(archive.path())
            .map_err(|err| TransferError::io("creating temporary archive", err))?;
        let mut builder = tar::Builder::new(BufWriter::new(file));
        builder.follow_symlinks(false);
        builder
            .append_dir_all(&root_name, folder)
            .map_err(|err| {
                TransferError::new(
                    TransferErrorCode::Archive,
                    format!("archiving {}: {err}", folder.display()),
                )
            })?;
        let mut writer = builder.into_inner().map_err(|err| {
            TransferError::new(TransferErrorCode::Archive, format!("finishing archive: {err}"))
        })?;
        writer
            .flush()
            .map_err(|err| TransferError::io("flushing temporary archive", err))?;
    }

    let mut file = File::open(archive.path())
        .map_err(|err| TransferError::io("reopening temporary archive", err))?;
    let mut chunks = Vec::new();
    let mut window = vec![0_u8; chunk_size];
    loop {
        let filled = fill_window(&mut file, &mut window)
            .map_err(|err| TransferError::io("reading temporary archive", err))?;
        if filled == 0 {
            break;
        }
        chunks.push(Chunk {
            name: Chunk::name_for(chunks.len()),
            data: STANDARD.encode(&window[..filled]),
        });
        if filled < chunk_size {
            break;
        }
    }
    debug!(folder = %folder.display(), chunks = chunks.len(), "serialized folder");
    Ok(ChunkSet { chunks })
}

fn fill_window(reader: &mut impl Read, window: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < window.len() {
        let read = reader.read(&mut window[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Reassembles the archive from `set`, unpacks it next to `destination`,
/// strips bookkeeping artifacts and moves the archived folder's children
/// into `destination`.
pub fn deserialize_chunks(set: &ChunkSet, destination: &Path) -> TransferResult<()> {
    let ordered = set.ordered()?;
    let parent = destination
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    std::fs::create_dir_all(&parent)
        .map_err(|err| TransferError::io(format!("creating {}", parent.display()), err))?;

    let archive = ScratchPath::new(&parent, "archive");
    {
        let file = File::create(archive.path())
            .map_err(|err| TransferError::io("creating temporary archive", err))?;
        let mut writer = BufWriter::new(file);
        for chunk in &ordered {
            let bytes = STANDARD.decode(chunk.data.trim()).map_err(|err| {
                TransferError::new(
                    TransferErrorCode::Encoding,
                    format!("chunk {} is not valid base64: {err}", chunk.name),
                )
            })?;
            writer
                .write_all(&bytes)
                .map_err(|err| TransferError::io("writing temporary archive", err))?;
        }
        writer
            .flush()
            .map_err(|err| TransferError::io("flushing temporary archive", err))?;
    }

    let unpacked = ScratchPath::new(&parent, "unpack");
    std::fs::create_dir_all(unpacked.path())
        .map_err(|err| TransferError::io("creating unpack directory", err))?;
    if !ordered.is_empty() {
        let file = File::open(archive.path())
            .map_err(|err| TransferError::io("reopening temporary archive", err))?;
        tar::Archive::new(file)
            .unpack(unpacked.path())
            .map_err(|err| {
                TransferError::new(TransferErrorCode::Archive, format!("unpacking archive: {err}"))
            })?;
    }

    let root = archived_root(unpacked.path())?;
    strip_bookkeeping(&root)?;
    std::fs::create_dir_all(destination)
        .map_err(|err| TransferError::io(format!("creating {}", destination.display()), err))?;
    promote_children(&root, destination)?;
    debug!(destination = %destination.display(), chunks = ordered.len(), "deserialized chunks");
    Ok(())
}

/// The single top-level directory of an unpacked archive, or the unpack
/// directory itself when the archive has any other shape.
fn archived_root(unpacked: &Path) -> TransferResult<PathBuf> {
    let entries = std::fs::read_dir(unpacked)
        .map_err(|err| TransferError::io("reading unpack directory", err))?
        .filter_map(|entry| entry.ok())
        .collect::<Vec<_>>();
    match entries.as_slice() {
        [only] if only.path().is_dir() => Ok(only.path()),
        _ => Ok(unpacked.to_path_buf()),
    }
}

pub fn is_bookkeeping(name: &str) -> bool {
    BOOKKEEPING_NAMES.contains(&name)
        || name.starts_with(INTERNAL_FILE_PREFIX)
        || name.starts_with(&format!(".{INTERNAL_FILE_PREFIX}"))
        || chunk_index(name).is_some()
}

/// Removes bookkeeping entries from the top level of `root`.
pub fn strip_bookkeeping(root: &Path) -> TransferResult<()> {
    let entries = std::fs::read_dir(root)
        .map_err(|err| TransferError::io(format!("reading {}", root.display()), err))?;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_bookkeeping(&name) {
            continue;
        }
        let path = entry.path();
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        removed.map_err(|err| TransferError::io(format!("removing {}", path.display()), err))?;
    }
    Ok(())
}

fn promote_children(root: &Path, destination: &Path) -> TransferResult<()> {
    let entries = std::fs::read_dir(root)
        .map_err(|err| TransferError::io(format!("reading {}", root.display()), err))?;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let target = destination.join(entry.file_name());
        clear_target(&target)?;
        std::fs::rename(entry.path(), &target).map_err(|err| {
            TransferError::io(format!("moving into {}", target.display()), err)
        })?;
    }
    Ok(())
}

/// Removes whatever sits at `target` without following symlinks.
fn clear_target(target: &Path) -> TransferResult<()> {
    let removed = match std::fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(target),
        Ok(_) => std::fs::remove_file(target),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => Err(err),
    };
    removed.map_err(|err| TransferError::io(format!("removing {}", target.display()), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn temp_path(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "mission-agent-transfer-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&path);
        path
    }

    fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
        fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
            for entry in std::fs::read_dir(dir).expect("read dir") {
                let entry = entry.expect("entry");
                let path = entry.path();
                let rel = path
                    .strip_prefix(base)
                    .expect("relative")
                    .to_string_lossy()
                    .replace('\\', "/");
                if path.is_dir() {
                    out.insert(format!("{rel}/"), Vec::new());
                    walk(base, &path, out);
                } else {
                    out.insert(rel, std::fs::read(&path).expect("read file"));
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    fn sample_folder(root: &Path) -> PathBuf {
        let folder = root.join("data");
        std::fs::create_dir_all(folder.join("nested/deeper")).expect("mkdir");
        std::fs::write(folder.join("a.txt"), "alpha").expect("write");
        std::fs::write(folder.join("nested/b.bin"), (0..=255u8).cycle().take(5000).collect::<Vec<_>>())
            .expect("write");
        std::fs::write(folder.join("nested/deeper/c.json"), "{\"k\":1}").expect("write");
        folder
    }

    fn leftover_scratch(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .filter(|name| name.starts_with(&format!(".{INTERNAL_FILE_PREFIX}")))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn round_trip_preserves_contents_across_chunk_sizes() {
        let root = temp_path("roundtrip");
        let folder = sample_folder(&root);
        let expected = snapshot(&folder);

        for chunk_size in [1, 7, 512, 4096, EMBEDDED_CHUNK_SIZE] {
            let set = serialize_folder(&folder, chunk_size).expect("serialize");
            assert!(!set.is_empty());
            let destination = root.join(format!("out-{chunk_size}"));
            deserialize_chunks(&set, &destination).expect("deserialize");
            assert_eq!(snapshot(&destination), expected, "chunk size {chunk_size}");
        }
        assert!(leftover_scratch(&root).is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn exact_multiple_archive_size_has_no_trailing_empty_chunk() {
        let root = temp_path("multiple");
        let folder = sample_folder(&root);
        // tar output is always a multiple of 512 bytes.
        let set = serialize_folder(&folder, 512).expect("serialize");
        for chunk in &set.chunks {
            let decoded = STANDARD.decode(&chunk.data).expect("decode");
            assert_eq!(decoded.len(), 512);
        }
        let destination = root.join("out");
        deserialize_chunks(&set, &destination).expect("deserialize");
        assert_eq!(snapshot(&destination), snapshot(&folder));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn empty_folder_round_trips() {
        let root = temp_path("empty");
        let folder = root.join("empty");
        std::fs::create_dir_all(&folder).expect("mkdir");
        let set = serialize_folder(&folder, EMBEDDED_CHUNK_SIZE).expect("serialize");
        let destination = root.join("out");
        deserialize_chunks(&set, &destination).expect("deserialize");
        assert!(destination.is_dir());
        assert!(snapshot(&destination).is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn chunk_order_comes_from_names_and_files() {
        let root = temp_path("order");
        let folder = sample_folder(&root);
        let mut set = serialize_folder(&folder, 1024).expect("serialize");
        assert!(set.len() > 2);
        set.chunks.reverse();

        let chunk_dir = root.join("chunks");
        set.write_to_dir(&chunk_dir).expect("write chunks");
        std::fs::write(chunk_dir.join("unrelated.txt"), "x").expect("write");
        let reread = ChunkSet::read_from_dir(&chunk_dir).expect("read chunks");
        assert_eq!(reread.len(), set.len());

        let destination = root.join("out");
        deserialize_chunks(&reread, &destination).expect("deserialize");
        assert_eq!(snapshot(&destination), snapshot(&folder));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_chunk_and_bad_base64_fail_without_leftovers() {
        let root = temp_path("broken");
        let folder = sample_folder(&root);
        let mut set = serialize_folder(&folder, 1024).expect("serialize");
        set.chunks.remove(1);
        let err = deserialize_chunks(&set, &root.join("out")).expect_err("gap");
        assert_eq!(err.code, TransferErrorCode::MissingChunk);

        let corrupt = ChunkSet {
            chunks: vec![Chunk {
                name: Chunk::name_for(0),
                data: "!!!not base64!!!".to_owned(),
            }],
        };
        let err = deserialize_chunks(&corrupt, &root.join("out")).expect_err("encoding");
        assert_eq!(err.code, TransferErrorCode::Encoding);
        assert!(leftover_scratch(&root).is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn bookkeeping_is_stripped_from_unpacked_root() {
        let root = temp_path("strip");
        let folder = sample_folder(&root);
        std::fs::create_dir_all(folder.join("node_modules/lodash")).expect("mkdir");
        std::fs::create_dir_all(folder.join(".git")).expect("mkdir");
        std::fs::write(folder.join("package.json"), "{}").expect("write");
        std::fs::write(folder.join("agent-data-handling-operation.js"), "").expect("write");
        std::fs::write(folder.join("data_0.base64.chunked"), "").expect("write");

        let set = serialize_folder(&folder, 4096).expect("serialize");
        let destination = root.join("out");
        deserialize_chunks(&set, &destination).expect("deserialize");
        let names = snapshot(&destination);
        assert!(names.contains_key("a.txt"));
        assert!(names.keys().all(|name| !name.starts_with("node_modules")));
        assert!(!names.contains_key(".git/"));
        assert!(!names.contains_key("package.json"));
        assert!(!names.contains_key("agent-data-handling-operation.js"));
        assert!(!names.contains_key("data_0.base64.chunked"));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn existing_destination_entries_are_replaced() {
        let root = temp_path("replace");
        let folder = sample_folder(&root);
        let destination = root.join("out");
        std::fs::create_dir_all(destination.join("a.txt/stale")).expect("mkdir");
        std::fs::write(destination.join("nested"), "stale file").expect("write");
        std::fs::write(destination.join("kept.txt"), "kept").expect("write");

        let set = serialize_folder(&folder, 4096).expect("serialize");
        deserialize_chunks(&set, &destination).expect("deserialize");
        let mut expected = snapshot(&folder);
        expected.insert("kept.txt".to_owned(), b"kept".to_vec());
        assert_eq!(snapshot(&destination), expected);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn clearing_an_unreachable_target_reports_the_path() {
        let root = temp_path("clear");
        std::fs::create_dir_all(&root).expect("mkdir");
        let file = root.join("plain.txt");
        std::fs::write(&file, "x").expect("write");
        clear_target(&root.join("absent")).expect("absent target is fine");

        let err = clear_target(&file.join("child")).expect_err("parent is a file");
        assert_eq!(err.code, TransferErrorCode::Io);
        assert!(err.message.contains("removing"));
        assert!(err.message.contains("plain.txt/child"));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn chunk_index_parses_names() {
        assert_eq!(chunk_index("data_12.base64.chunked"), Some(12));
        assert_eq!(chunk_index("data_x.base64.chunked"), None);
        assert_eq!(chunk_index("data_1.txt"), None);
    }
}
