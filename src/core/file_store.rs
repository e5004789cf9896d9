use std::{
	fs,
	io,
	path::{Path, PathBuf}
};

/// Durable storage of chunks and restored files.
/// Reads fail with `io::ErrorKind::NotFound` when absent.
pub trait ChunkStore {
	fn write_chunk(&self, file_id: &str, chunk_no: u32, data: &[u8]) -> io::Result<()>;
	fn read_chunk(&self, file_id: &str, chunk_no: u32) -> io::Result<Vec<u8>>;
	fn delete_chunk(&self, file_id: &str, chunk_no: u32) -> io::Result<()>;
	/// Remove every chunk of a file
	fn delete_file_chunks(&self, file_id: &str) -> io::Result<()>;
	fn write_file(&self, name: &str, parts: &[Vec<u8>]) -> io::Result<PathBuf>;
	fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// Chunks live under `<root>/chunks/<file id>/<chunk no>`,
/// restored files under `<root>/restored/<name>`
#[derive(Clone, Debug)]
pub struct DiskStore {
	root: PathBuf
}

impl DiskStore {
	pub fn new(root: &Path) -> Self {
		DiskStore {
			root: root.to_path_buf()
		}
	}

	pub fn chunk_dir(&self, file_id: &str) -> PathBuf {
		self.root.join("chunks").join(file_id)
	}

	fn chunk_path(&self, file_id: &str, chunk_no: u32) -> PathBuf {
		self.chunk_dir(file_id).join(chunk_no.to_string())
	}

	pub fn restored_path(&self, name: &str) -> PathBuf {
		// only the last component so a name never escapes the directory
		let name = Path::new(name).file_name().unwrap_or_else(|| "unnamed".as_ref());
		self.root.join("restored").join(name)
	}
}

impl ChunkStore for DiskStore {
	fn write_chunk(&self, file_id: &str, chunk_no: u32, data: &[u8]) -> io::Result<()> {
		fs::create_dir_all(self.chunk_dir(file_id))?;
		fs::write(self.chunk_path(file_id, chunk_no), data)
	}

	fn read_chunk(&self, file_id: &str, chunk_no: u32) -> io::Result<Vec<u8>> {
		fs::read(self.chunk_path(file_id, chunk_no))
	}

	fn delete_chunk(&self, file_id: &str, chunk_no: u32) -> io::Result<()> {
		fs::remove_file(self.chunk_path(file_id, chunk_no))?;
		// drop the directory once empty
		let _ = fs::remove_dir(self.chunk_dir(file_id));
		Ok(())
	}

	fn delete_file_chunks(&self, file_id: &str) -> io::Result<()> {
		match fs::remove_dir_all(self.chunk_dir(file_id)) {
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			result => result
		}
	}

	fn write_file(&self, name: &str, parts: &[Vec<u8>]) -> io::Result<PathBuf> {
		let path = self.restored_path(name);
		if let Some(dir) = path.parent() {
			fs::create_dir_all(dir)?;
		}
		fs::write(&path, parts.concat())?;
		Ok(path)
	}

	fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
		fs::read(path)
	}
}
