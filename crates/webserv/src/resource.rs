// src/resource.rs
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::ptr::NonNull;

/// Outcome of resolving a request path against the document root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Found(u64),
    NotFound,
    Forbidden,
}

/// Join `path` onto `root`, refusing anything that climbs out of it.
pub fn resolve(root: &Path, path: &str) -> Option<PathBuf> {
    let rel = Path::new(path.trim_start_matches('/'));
    if rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
        return None;
    }
    Some(root.join(rel))
}

/// Missing paths and directories are not found; files without the
/// world-read bit, and paths escaping `root`, are forbidden.
pub fn lookup(root: &Path, path: &str) -> Resource {
    let Some(full) = resolve(root, path) else {
        return Resource::Forbidden;
    };
    match std::fs::metadata(&full) {
        Ok(meta) if meta.is_dir() => Resource::NotFound,
        Ok(meta) if meta.permissions().mode() & (libc::S_IROTH as u32) == 0 => Resource::Forbidden,
        Ok(meta) => Resource::Found(meta.len()),
        Err(_) => Resource::NotFound,
    }
}

/// Read-only private mapping of a whole file, unmapped on drop.
///
/// Empty files carry no mapping since `mmap` rejects zero-length regions.
pub struct MappedFile {
    ptr: Option<NonNull<u8>>,
    len: usize,
}

// The mapping is read-only and owned; nothing aliases it mutably.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Ok(Self { ptr: None, len: 0 });
        }

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        // The mapping outlives the descriptor; `file` closes here.
        Ok(Self {
            ptr: NonNull::new(addr as *mut u8),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self.ptr {
            Some(p) => unsafe { std::slice::from_raw_parts(p.as_ptr(), self.len) },
            None => &[],
        }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Some(p) = self.ptr.take() {
            unsafe {
                libc::munmap(p.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn set_mode(path: &Path, mode: u32) {
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn lookup_classifies_paths() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("index.html"), b"<h1>hi</h1>").unwrap();
        fs::write(root.path().join("secret.html"), b"nope").unwrap();
        set_mode(&root.path().join("secret.html"), 0o600);
        fs::create_dir(root.path().join("dir")).unwrap();

        assert_eq!(lookup(root.path(), "/index.html"), Resource::Found(11));
        assert_eq!(lookup(root.path(), "/secret.html"), Resource::Forbidden);
        assert_eq!(lookup(root.path(), "/dir"), Resource::NotFound);
        assert_eq!(lookup(root.path(), "/missing.html"), Resource::NotFound);
        assert_eq!(lookup(root.path(), "/../etc/passwd"), Resource::Forbidden);
    }

    #[test]
    fn mapped_file_exposes_contents() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("page.html");
        fs::write(&path, b"mapped bytes").unwrap();

        let mapped = MappedFile::open(&path).unwrap();
        assert_eq!(mapped.len(), 12);
        assert_eq!(mapped.as_slice(), b"mapped bytes");
    }

    #[test]
    fn empty_file_maps_to_nothing() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("empty.txt");
        fs::write(&path, b"").unwrap();

        let mapped = MappedFile::open(&path).unwrap();
        assert!(mapped.is_empty());
        assert_eq!(mapped.as_slice(), b"");
    }
}
