//! Filesystem operations executed on the worker pool.
//!
//! Descriptors handed to script are indexes into a [`FileTable`] shared by
//! the workers, not raw OS descriptors.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::CompletionPayload;
use crate::error::status;

/// First descriptor handed out; 0-2 stay reserved for stdio
const FIRST_FD: i32 = 3;

/// How a file is opened, parsed from the usual flag strings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlags {
    /// `r`
    Read,
    /// `r+`
    ReadWrite,
    /// `w`
    Write,
    /// `w+`
    WriteRead,
    /// `a`
    Append,
    /// `a+`
    AppendRead,
    /// `wx` / `w+x`: create, failing if the file exists
    WriteExclusive,
}

impl OpenFlags {
    /// Parse a flag string such as `"r+"`
    pub fn parse(flags: &str) -> Option<Self> {
        match flags {
            "r" | "rs" => Some(OpenFlags::Read),
            "r+" | "rs+" => Some(OpenFlags::ReadWrite),
            "w" => Some(OpenFlags::Write),
            "w+" => Some(OpenFlags::WriteRead),
            "a" => Some(OpenFlags::Append),
            "a+" => Some(OpenFlags::AppendRead),
            "wx" | "xw" | "w+x" | "wx+" => Some(OpenFlags::WriteExclusive),
            _ => None,
        }
    }

    fn options(&self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            OpenFlags::Read => opts.read(true),
            OpenFlags::ReadWrite => opts.read(true).write(true),
            OpenFlags::Write => opts.write(true).create(true).truncate(true),
            OpenFlags::WriteRead => opts.read(true).write(true).create(true).truncate(true),
            OpenFlags::Append => opts.append(true).create(true),
            OpenFlags::AppendRead => opts.read(true).append(true).create(true),
            OpenFlags::WriteExclusive => opts.read(true).write(true).create_new(true),
        };
        opts
    }
}

/// A filesystem request
#[derive(Debug, Clone)]
pub enum FsOp {
    /// Open a file
    Open {
        /// Path
        path: PathBuf,
        /// Open mode
        flags: OpenFlags,
        /// Permission bits for created files
        mode: u32,
    },
    /// Close a descriptor
    Close {
        /// Descriptor
        fd: i32,
    },
    /// Read up to `len` bytes
    Read {
        /// Descriptor
        fd: i32,
        /// Maximum bytes
        len: usize,
        /// Absolute position, or the current offset when `None`
        position: Option<u64>,
    },
    /// Write bytes
    Write {
        /// Descriptor
        fd: i32,
        /// Bytes to write
        data: Vec<u8>,
        /// Absolute position, or the current offset when `None`
        position: Option<u64>,
    },
    /// Stat a path
    Stat {
        /// Path
        path: PathBuf,
    },
    /// Stat a descriptor
    Fstat {
        /// Descriptor
        fd: i32,
    },
    /// List directory entries
    ReadDir {
        /// Path
        path: PathBuf,
    },
    /// Create a directory
    Mkdir {
        /// Path
        path: PathBuf,
        /// Permission bits
        mode: u32,
    },
    /// Remove an empty directory
    Rmdir {
        /// Path
        path: PathBuf,
    },
    /// Remove a file
    Unlink {
        /// Path
        path: PathBuf,
    },
    /// Rename a path
    Rename {
        /// Current path
        from: PathBuf,
        /// New path
        to: PathBuf,
    },
}

impl FsOp {
    /// System call name used in error reports
    pub fn syscall(&self) -> &'static str {
        match self {
            FsOp::Open { .. } => "open",
            FsOp::Close { .. } => "close",
            FsOp::Read { .. } => "read",
            FsOp::Write { .. } => "write",
            FsOp::Stat { .. } => "stat",
            FsOp::Fstat { .. } => "fstat",
            FsOp::ReadDir { .. } => "scandir",
            FsOp::Mkdir { .. } => "mkdir",
            FsOp::Rmdir { .. } => "rmdir",
            FsOp::Unlink { .. } => "unlink",
            FsOp::Rename { .. } => "rename",
        }
    }
}

/// File metadata delivered to stat callbacks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    /// Device id
    pub dev: u64,
    /// Mode bits
    pub mode: u32,
    /// Hard link count
    pub nlink: u64,
    /// Owner user id
    pub uid: u32,
    /// Owner group id
    pub gid: u32,
    /// Device id for special files
    pub rdev: u64,
    /// Inode number
    pub ino: u64,
    /// Size in bytes
    pub size: u64,
    /// Preferred I/O block size
    pub blksize: u64,
    /// Allocated 512-byte blocks
    pub blocks: u64,
    /// Last access, milliseconds since the epoch
    pub atime_ms: f64,
    /// Last modification, milliseconds since the epoch
    pub mtime_ms: f64,
    /// Last status change, milliseconds since the epoch
    pub ctime_ms: f64,
    /// Regular file
    pub is_file: bool,
    /// Directory
    pub is_directory: bool,
}

impl FileStat {
    fn from_metadata(meta: &fs::Metadata) -> Self {
        let mut stat = FileStat {
            size: meta.len(),
            atime_ms: meta.accessed().map(epoch_ms).unwrap_or(0.0),
            mtime_ms: meta.modified().map(epoch_ms).unwrap_or(0.0),
            is_file: meta.is_file(),
            is_directory: meta.is_dir(),
            ..FileStat::default()
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            stat.dev = meta.dev();
            stat.mode = meta.mode();
            stat.nlink = meta.nlink();
            stat.uid = meta.uid();
            stat.gid = meta.gid();
            stat.rdev = meta.rdev();
            stat.ino = meta.ino();
            stat.blksize = meta.blksize();
            stat.blocks = meta.blocks();
            stat.ctime_ms = meta.ctime() as f64 * 1000.0 + meta.ctime_nsec() as f64 / 1e6;
        }
        stat
    }
}

fn epoch_ms(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Open files addressed by descriptor
#[derive(Debug)]
pub struct FileTable {
    files: Mutex<HashMap<i32, Arc<Mutex<File>>>>,
    next_fd: AtomicI32,
}

impl Default for FileTable {
    fn default() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            next_fd: AtomicI32::new(FIRST_FD),
        }
    }
}

impl FileTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, file: File) -> i32 {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.files.lock().insert(fd, Arc::new(Mutex::new(file)));
        fd
    }

    fn get(&self, fd: i32) -> Result<Arc<Mutex<File>>, i32> {
        self.files.lock().get(&fd).cloned().ok_or(status::EBADF)
    }

    fn remove(&self, fd: i32) -> Result<(), i32> {
        self.files.lock().remove(&fd).map(|_| ()).ok_or(status::EBADF)
    }

    /// Number of open descriptors
    pub fn open_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Execute one operation, returning its status and payload
    pub fn execute(&self, op: FsOp) -> (i32, CompletionPayload) {
        match self.run(op) {
            Ok(payload) => (status::OK, payload),
            Err(code) => (code, CompletionPayload::None),
        }
    }

    fn run(&self, op: FsOp) -> Result<CompletionPayload, i32> {
        let io = |e: std::io::Error| status::from_io_error(&e);
        match op {
            FsOp::Open { path, flags, mode } => {
                let mut opts = flags.options();
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    opts.mode(mode);
                }
                #[cfg(not(unix))]
                let _ = mode;
                let file = opts.open(path).map_err(io)?;
                Ok(CompletionPayload::Fd(self.insert(file)))
            }
            FsOp::Close { fd } => {
                self.remove(fd)?;
                Ok(CompletionPayload::None)
            }
            FsOp::Read { fd, len, position } => {
                let file = self.get(fd)?;
                let mut file = file.lock();
                if let Some(pos) = position {
                    file.seek(SeekFrom::Start(pos)).map_err(io)?;
                }
                let mut data = vec![0u8; len];
                let mut filled = 0;
                while filled < len {
                    match file.read(&mut data[filled..]).map_err(io)? {
                        0 => break,
                        n => filled += n,
                    }
                }
                data.truncate(filled);
                Ok(CompletionPayload::Data(data))
            }
            FsOp::Write { fd, data, position } => {
                let file = self.get(fd)?;
                let mut file = file.lock();
                if let Some(pos) = position {
                    file.seek(SeekFrom::Start(pos)).map_err(io)?;
                }
                file.write_all(&data).map_err(io)?;
                Ok(CompletionPayload::Count(data.len()))
            }
            FsOp::Stat { path } => {
                let meta = fs::metadata(path).map_err(io)?;
                Ok(CompletionPayload::Stat(FileStat::from_metadata(&meta)))
            }
            FsOp::Fstat { fd } => {
                let file = self.get(fd)?;
                let meta = file.lock().metadata().map_err(io)?;
                Ok(CompletionPayload::Stat(FileStat::from_metadata(&meta)))
            }
            FsOp::ReadDir { path } => {
                let mut names = Vec::new();
                for entry in fs::read_dir(path).map_err(io)? {
                    let entry = entry.map_err(io)?;
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                Ok(CompletionPayload::Entries(names))
            }
            FsOp::Mkdir { path, mode } => {
                let mut builder = fs::DirBuilder::new();
                #[cfg(unix)]
                {
                    use std::os::unix::fs::DirBuilderExt;
                    builder.mode(mode);
                }
                #[cfg(not(unix))]
                let _ = mode;
                builder.create(path).map_err(io)?;
                Ok(CompletionPayload::None)
            }
            FsOp::Rmdir { path } => {
                fs::remove_dir(path).map_err(io)?;
                Ok(CompletionPayload::None)
            }
            FsOp::Unlink { path } => {
                fs::remove_file(path).map_err(io)?;
                Ok(CompletionPayload::None)
            }
            FsOp::Rename { from, to } => {
                fs::rename(from, to).map_err(io)?;
                Ok(CompletionPayload::None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        assert_eq!(OpenFlags::parse("r"), Some(OpenFlags::Read));
        assert_eq!(OpenFlags::parse("a+"), Some(OpenFlags::AppendRead));
        assert_eq!(OpenFlags::parse("wx"), Some(OpenFlags::WriteExclusive));
        assert_eq!(OpenFlags::parse("z"), None);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let table = FileTable::new();

        let (st, payload) = table.execute(FsOp::Open {
            path: path.clone(),
            flags: OpenFlags::WriteRead,
            mode: 0o644,
        });
        assert_eq!(st, status::OK);
        let CompletionPayload::Fd(fd) = payload else {
            panic!("expected fd, got {:?}", payload);
        };
        assert!(fd >= FIRST_FD);

        let (st, payload) = table.execute(FsOp::Write {
            fd,
            data: b"hello world".to_vec(),
            position: Some(0),
        });
        assert_eq!(st, status::OK);
        assert!(matches!(payload, CompletionPayload::Count(11)));

        let (_, payload) = table.execute(FsOp::Read {
            fd,
            len: 5,
            position: Some(6),
        });
        assert!(matches!(payload, CompletionPayload::Data(ref d) if d == b"world"));

        assert_eq!(table.execute(FsOp::Close { fd }).0, status::OK);
        assert_eq!(table.execute(FsOp::Close { fd }).0, status::EBADF);
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_stat_and_read_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"abc").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        let table = FileTable::new();

        let (_, payload) = table.execute(FsOp::Stat {
            path: dir.path().join("b.txt"),
        });
        match payload {
            CompletionPayload::Stat(stat) => {
                assert_eq!(stat.size, 3);
                assert!(stat.is_file);
            }
            other => panic!("expected stat, got {:?}", other),
        }

        let (_, payload) = table.execute(FsOp::ReadDir {
            path: dir.path().to_path_buf(),
        });
        assert!(
            matches!(payload, CompletionPayload::Entries(ref names) if names == &["a", "b.txt"])
        );
    }

    #[test]
    fn test_missing_path_reports_enoent() {
        let table = FileTable::new();
        let (st, payload) = table.execute(FsOp::Stat {
            path: PathBuf::from("/definitely/not/here"),
        });
        assert_eq!(st, status::ENOENT);
        assert!(matches!(payload, CompletionPayload::None));
    }

    #[test]
    fn test_rename_and_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("old");
        let to = dir.path().join("new");
        std::fs::write(&from, b"x").unwrap();
        let table = FileTable::new();

        assert_eq!(table.execute(FsOp::Rename { from: from.clone(), to: to.clone() }).0, 0);
        assert!(!from.exists());
        assert_eq!(table.execute(FsOp::Unlink { path: to.clone() }).0, 0);
        assert!(!to.exists());
    }
}
