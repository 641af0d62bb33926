//! Per-file manifest of installed product content
//!
//! One line per path:
//!
//! ```text
//! d 'bin' 0
//! f 'bin/setup.sh' 112 9e107d9d372bb6826bd81d3542a419d6
//! l 'bin/current' 0 'setup.sh'
//! f '/etc/fleet/agent.conf' 20 d41d8cd98f00b204e9800998ecf8427e
//! ```
//!
//! Client-data paths are relative to the product's client-data directory;
//! server-data paths start with `/` and are relative to the server root.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use rayon::prelude::*;

use crate::error::{FleetpkgError, Result};
use crate::pool::WorkerPool;

/// Type of a manifest entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    fn code(self) -> char {
        match self {
            EntryKind::File => 'f',
            EntryKind::Directory => 'd',
            EntryKind::Symlink => 'l',
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "f" => Some(EntryKind::File),
            "d" => Some(EntryKind::Directory),
            "l" => Some(EntryKind::Symlink),
            _ => None,
        }
    }
}

/// One installed path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub kind: EntryKind,
    /// Relative client path, or `/`-prefixed server path
    pub path: String,
    pub size: u64,
    /// MD5 of a regular file
    pub checksum: Option<String>,
    /// Target of a symlink
    pub target: Option<String>,
}

impl ManifestEntry {
    pub fn is_server_path(&self) -> bool {
        self.path.starts_with('/')
    }

    /// Location of the entry on disk
    pub fn resolve(&self, client_dir: &Path, server_root: &Path) -> PathBuf {
        match self.path.strip_prefix('/') {
            Some(rest) => server_root.join(rest),
            None => client_dir.join(&self.path),
        }
    }

    fn to_line(&self) -> String {
        let mut line = format!("{} {} {}", self.kind.code(), quote(&self.path), self.size);
        match self.kind {
            EntryKind::File => {
                if let Some(checksum) = &self.checksum {
                    line.push(' ');
                    line.push_str(checksum);
                }
            }
            EntryKind::Symlink => {
                if let Some(target) = &self.target {
                    line.push(' ');
                    line.push_str(&quote(target));
                }
            }
            EntryKind::Directory => {}
        }
        line
    }

    fn from_line(line: &str, line_no: usize) -> Result<Self> {
        let tokens = tokenize(line).ok_or_else(|| invalid_line(line_no, "unbalanced quotes"))?;

        let kind = tokens
            .first()
            .and_then(|t| EntryKind::from_code(t))
            .ok_or_else(|| invalid_line(line_no, "unknown entry type"))?;
        let path = tokens
            .get(1)
            .cloned()
            .ok_or_else(|| invalid_line(line_no, "missing path"))?;
        let size = tokens
            .get(2)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| invalid_line(line_no, "missing or invalid size"))?;
        let extra = tokens.get(3).cloned();

        let (checksum, target) = match kind {
            EntryKind::File => (extra, None),
            EntryKind::Symlink => (None, extra),
            EntryKind::Directory => (None, None),
        };

        Ok(ManifestEntry {
            kind,
            path,
            size,
            checksum,
            target,
        })
    }
}

/// A difference between the manifest and the filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub path: PathBuf,
    pub expected: String,
    pub actual: String,
}

impl From<Mismatch> for FleetpkgError {
    fn from(m: Mismatch) -> Self {
        FleetpkgError::Verification {
            path: m.path,
            expected: m.expected,
            actual: m.actual,
        }
    }
}

/// Manifest of every path a product installed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileManifest {
    entries: Vec<ManifestEntry>,
}

impl FileManifest {
    /// Compute entries for the tracked client and server paths
    pub fn compute(
        client_dir: &Path,
        client_paths: &[PathBuf],
        server_root: &Path,
        server_paths: &[PathBuf],
        pool: &WorkerPool,
    ) -> Result<Self> {
        let mut work: Vec<(String, PathBuf)> = Vec::new();
        for rel in sorted_unique(client_paths) {
            work.push((slash_path(&rel), client_dir.join(&rel)));
        }
        for rel in sorted_unique(server_paths) {
            work.push((format!("/{}", slash_path(&rel)), server_root.join(&rel)));
        }

        let entries = pool.install(|| {
            work.par_iter()
                .map(|(name, path)| describe(name, path))
                .collect::<Result<Vec<_>>>()
        })?;

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to manifest text
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_line());
            out.push('\n');
        }
        out
    }

    /// Parse manifest text
    pub fn parse(text: &str) -> Result<Self> {
        let entries = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| ManifestEntry::from_line(line, idx + 1))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_text())?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Compare every entry against the filesystem and collect all differences
    pub fn audit(&self, client_dir: &Path, server_root: &Path) -> Result<Vec<Mismatch>> {
        let mut mismatches = Vec::new();

        for entry in &self.entries {
            let path = entry.resolve(client_dir, server_root);
            let actual = match fs::symlink_metadata(&path) {
                Ok(_) => describe(&entry.path, &path)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    mismatches.push(Mismatch {
                        path,
                        expected: entry.to_line(),
                        actual: "missing".to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            // Directory sizes are not tracked
            let differs = actual.kind != entry.kind
                || (entry.kind == EntryKind::File
                    && (actual.size != entry.size || actual.checksum != entry.checksum))
                || (entry.kind == EntryKind::Symlink && actual.target != entry.target);

            if differs {
                mismatches.push(Mismatch {
                    path,
                    expected: entry.to_line(),
                    actual: actual.to_line(),
                });
            }
        }

        Ok(mismatches)
    }

    /// Fail with a verification error on the first difference
    pub fn verify(&self, client_dir: &Path, server_root: &Path) -> Result<()> {
        match self.audit(client_dir, server_root)?.into_iter().next() {
            Some(mismatch) => Err(mismatch.into()),
            None => Ok(()),
        }
    }
}

/// Build the manifest entry for one path on disk
fn describe(name: &str, path: &Path) -> Result<ManifestEntry> {
    let metadata = fs::symlink_metadata(path)?;
    let file_type = metadata.file_type();

    let entry = if file_type.is_symlink() {
        let target = fs::read_link(path)?;
        ManifestEntry {
            kind: EntryKind::Symlink,
            path: name.to_string(),
            size: 0,
            checksum: None,
            target: Some(slash_path(&target)),
        }
    } else if file_type.is_dir() {
        ManifestEntry {
            kind: EntryKind::Directory,
            path: name.to_string(),
            size: 0,
            checksum: None,
            target: None,
        }
    } else {
        ManifestEntry {
            kind: EntryKind::File,
            path: name.to_string(),
            size: metadata.len(),
            checksum: Some(md5_file(path)?),
            target: None,
        }
    };

    Ok(entry)
}

/// MD5 of a file as lowercase hex
pub fn md5_file(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut context = Md5::new();
    let mut buffer = [0u8; 32768];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        context.update(&buffer[..read]);
    }

    Ok(hex::encode(context.finalize()))
}

fn sorted_unique(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = paths.to_vec();
    paths.sort();
    paths.dedup();
    paths
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// Split a line into bare and single-quoted tokens
fn tokenize(line: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut token = String::new();
        if c == '\'' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next()? {
                        'n' => token.push('\n'),
                        'r' => token.push('\r'),
                        escaped => token.push(escaped),
                    },
                    '\'' => {
                        closed = true;
                        break;
                    }
                    other => token.push(other),
                }
            }
            if !closed {
                return None;
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    Some(tokens)
}

fn invalid_line(line: usize, message: &str) -> FleetpkgError {
    FleetpkgError::parse(line, "manifest", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn build_tree(root: &Path) -> Vec<PathBuf> {
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("bin/setup.sh"), "#!/bin/sh\necho hi\n").unwrap();
        fs::write(root.join("it's here.txt"), "quoted").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("setup.sh", root.join("bin/current")).unwrap();

        let mut paths = vec![
            PathBuf::from("bin"),
            PathBuf::from("bin/setup.sh"),
            PathBuf::from("it's here.txt"),
        ];
        if cfg!(unix) {
            paths.push(PathBuf::from("bin/current"));
        }
        paths
    }

    #[cfg(unix)]
    #[test]
    fn test_line_breaks_in_file_names() {
        let client = tempdir().unwrap();
        let server = tempdir().unwrap();
        fs::write(client.path().join("two\nlines\r.txt"), "x").unwrap();

        let pool = WorkerPool::new(1).unwrap();
        let manifest = FileManifest::compute(
            client.path(),
            &[PathBuf::from("two\nlines\r.txt")],
            server.path(),
            &[],
            &pool,
        )
        .unwrap();

        let text = manifest.to_text();
        assert_eq!(text.lines().count(), 1);

        let parsed = FileManifest::parse(&text).unwrap();
        assert_eq!(parsed, manifest);
        assert_eq!(parsed.entries()[0].path, "two\nlines\r.txt");
        parsed.verify(client.path(), server.path()).unwrap();
    }

    #[test]
    fn test_compute_write_read() {
        let client = tempdir().unwrap();
        let server = tempdir().unwrap();
        let client_paths = build_tree(client.path());
        fs::create_dir_all(server.path().join("etc/fleet")).unwrap();
        fs::write(server.path().join("etc/fleet/agent.conf"), "x=1\n").unwrap();

        let pool = WorkerPool::new(2).unwrap();
        let manifest = FileManifest::compute(
            client.path(),
            &client_paths,
            server.path(),
            &[PathBuf::from("etc/fleet/agent.conf")],
            &pool,
        )
        .unwrap();

        let setup = manifest
            .entries()
            .iter()
            .find(|e| e.path == "bin/setup.sh")
            .unwrap();
        assert_eq!(setup.kind, EntryKind::File);
        assert_eq!(setup.size, 18);
        assert_eq!(setup.checksum.as_ref().unwrap().len(), 32);

        let server_entry = manifest.entries().last().unwrap();
        assert_eq!(server_entry.path, "/etc/fleet/agent.conf");
        assert!(server_entry.is_server_path());

        let file = client.path().join("manifest.files");
        manifest.write(&file).unwrap();
        assert_eq!(FileManifest::read(&file).unwrap(), manifest);

        manifest.verify(client.path(), server.path()).unwrap();
    }

    #[test]
    fn test_audit_detects_changes() {
        let client = tempdir().unwrap();
        let server = tempdir().unwrap();
        let paths = build_tree(client.path());
        let pool = WorkerPool::new(1).unwrap();
        let manifest =
            FileManifest::compute(client.path(), &paths, server.path(), &[], &pool).unwrap();

        fs::write(client.path().join("bin/setup.sh"), "#!/bin/sh\necho HI\n").unwrap();
        fs::remove_file(client.path().join("it's here.txt")).unwrap();

        let mismatches = manifest.audit(client.path(), server.path()).unwrap();
        assert_eq!(mismatches.len(), 2);
        assert!(mismatches.iter().any(|m| m.actual == "missing"));

        assert!(matches!(
            manifest.verify(client.path(), server.path()),
            Err(FleetpkgError::Verification { .. })
        ));
    }

    #[test]
    fn test_tokenize_quoted_paths() {
        let tokens = tokenize(r"l 'a b\'c' 0 'x\\y'").unwrap();
        assert_eq!(tokens, vec!["l", "a b'c", "0", r"x\y"]);
        assert!(tokenize("f 'open 0").is_none());
        assert!(FileManifest::parse("x 'p' 0\n").is_err());
    }
}
