//! Input archive reading and output archive assembly.
//!
//! The output is written to `<output>.tmp` and renamed into place only after
//! the central directory has been flushed. If assembly fails part way the
//! temporary file is removed when the writer is dropped, so a failed run
//! never leaves a partial archive at the destination.

use memmap2::Mmap;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::write::{FileOptions, ZipWriter};
use zip::{CompressionMethod, ZipArchive};

use crate::error::Error;
use crate::manifest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEntry {
    Directory(String),
    Class { name: String, bytes: Vec<u8> },
    Resource { name: String, bytes: Vec<u8> },
}

/// Reads every entry of the application archive, in archive order.
pub fn read_input(path: &Path) -> Result<Vec<InputEntry>, Error> {
    let file = File::open(path).map_err(|e| Error::input(path, e))?;
    let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::input(path, e))? };
    let mut archive = ZipArchive::new(Cursor::new(&mmap[..])).map_err(|e| Error::input(path, e))?;

    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| Error::input(path, e))?;
        let name = entry.name().to_string();
        if entry.is_dir() {
            entries.push(InputEntry::Directory(name));
            continue;
        }
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes).map_err(|e| Error::input(path, e))?;
        if name.ends_with(".class") {
            entries.push(InputEntry::Class { name, bytes });
        } else {
            entries.push(InputEntry::Resource { name, bytes });
        }
    }
    debug!(path = %path.display(), entries = entries.len(), "input archive read");
    Ok(entries)
}

/// Everything that goes into the output archive, already in final form.
#[derive(Debug, Default)]
pub struct OutputLayout {
    pub directories: Vec<String>,
    /// Entry name and bytes of each processed class.
    pub classes: Vec<(String, Vec<u8>)>,
    /// Non-class entries in input order.
    pub resources: Vec<(String, Vec<u8>)>,
    /// Dotted `Main-Class` to write into the manifest; `None` copies the
    /// manifest unchanged.
    pub main_class: Option<String>,
    pub bootstrap: Option<(String, Vec<u8>)>,
}

/// Writes directories, then classes sorted by entry name, then resources in
/// input order, then the bootstrap class.
pub fn assemble(path: &Path, mut layout: OutputLayout) -> Result<usize, Error> {
    layout.classes.sort_by(|a, b| a.0.cmp(&b.0));
    let mut out = OutputArchive::create(path)?;

    for dir in &layout.directories {
        out.add_directory(dir)?;
    }
    for (name, bytes) in &layout.classes {
        out.add_file(name, bytes)?;
    }
    for (name, bytes) in &layout.resources {
        match &layout.main_class {
            Some(main) if manifest::is_manifest(name) => {
                out.add_file(name, &manifest::rewrite_main_class(bytes, main))?;
            }
            _ => out.add_file(name, bytes)?,
        }
    }
    if let Some((name, bytes)) = &layout.bootstrap {
        out.add_file(name, bytes)?;
    }
    out.finish()
}

pub struct OutputArchive {
    writer: Option<ZipWriter<BufWriter<File>>>,
    tmp: PathBuf,
    target: PathBuf,
    names: HashSet<String>,
    written: usize,
}

impl OutputArchive {
    pub fn create(target: &Path) -> Result<Self, Error> {
        let tmp = tmp_path(target);
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::output(target, e))?;
        }
        let file = File::create(&tmp).map_err(|e| Error::output(target, e))?;
        Ok(Self {
            writer: Some(ZipWriter::new(BufWriter::new(file))),
            tmp,
            target: target.to_path_buf(),
            names: HashSet::new(),
            written: 0,
        })
    }

    fn writer(&mut self) -> Result<&mut ZipWriter<BufWriter<File>>, Error> {
        let target = &self.target;
        self.writer
            .as_mut()
            .ok_or_else(|| Error::output(target, "archive already finished"))
    }

    /// Returns false when an entry of that name was already written.
    fn claim(&mut self, name: &str) -> bool {
        if self.names.insert(name.to_string()) {
            return true;
        }
        warn!(entry = name, "duplicate entry name, keeping the first");
        false
    }

    pub fn add_directory(&mut self, name: &str) -> Result<(), Error> {
        if !self.claim(name) {
            return Ok(());
        }
        let target = self.target.clone();
        self.writer()?
            .add_directory(name.trim_end_matches('/'), FileOptions::default())
            .map_err(|e| Error::output(&target, e))?;
        self.written += 1;
        Ok(())
    }

    pub fn add_file(&mut self, name: &str, bytes: &[u8]) -> Result<(), Error> {
        if !self.claim(name) {
            return Ok(());
        }
        let target = self.target.clone();
        let writer = self.writer()?;
        writer
            .start_file(name, FileOptions::default().compression_method(CompressionMethod::Deflated))
            .map_err(|e| Error::output(&target, e))?;
        writer.write_all(bytes).map_err(|e| Error::output(&target, e))?;
        self.written += 1;
        Ok(())
    }

    /// Flushes the archive and moves it to its destination. Returns the
    /// number of entries written.
    pub fn finish(mut self) -> Result<usize, Error> {
        let target = self.target.clone();
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| Error::output(&target, "archive already finished"))?;
        let mut buffered = writer.finish().map_err(|e| Error::output(&target, e))?;
        buffered.flush().map_err(|e| Error::output(&target, e))?;
        drop(buffered);

        fs::rename(&self.tmp, &self.target).map_err(|e| Error::output(&target, e))?;
        debug!(path = %self.target.display(), entries = self.written, "output archive written");
        // nothing left for the drop guard to clean up
        self.tmp = PathBuf::new();
        Ok(self.written)
    }
}

impl Drop for OutputArchive {
    fn drop(&mut self) {
        self.writer.take();
        if !self.tmp.as_os_str().is_empty() && self.tmp.exists() {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

fn tmp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path(suffix: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("class-shroud-archive-{}-{n}{suffix}", std::process::id()))
    }

    fn entry_names(path: &Path) -> Vec<String> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    fn read_entry(path: &Path, name: &str) -> Vec<u8> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut out = Vec::new();
        archive.by_name(name).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn entries_follow_the_output_order() {
        let path = temp_path(".jar");
        let layout = OutputLayout {
            directories: vec!["META-INF/".into(), "com/".into()],
            classes: vec![
                ("com/b/B.class".into(), vec![2]),
                ("com/a/A.class".into(), vec![1]),
            ],
            resources: vec![
                ("z.txt".into(), b"z".to_vec()),
                ("META-INF/MANIFEST.MF".into(), b"Manifest-Version: 1.0\r\n".to_vec()),
            ],
            main_class: None,
            bootstrap: Some(("shroud/Boot.class".into(), vec![3])),
        };
        assert_eq!(assemble(&path, layout).unwrap(), 7);

        assert_eq!(
            entry_names(&path),
            vec![
                "META-INF/",
                "com/",
                "com/a/A.class",
                "com/b/B.class",
                "z.txt",
                "META-INF/MANIFEST.MF",
                "shroud/Boot.class",
            ]
        );
        assert_eq!(read_entry(&path, "META-INF/MANIFEST.MF"), b"Manifest-Version: 1.0\r\n");
        assert!(!tmp_path(&path).exists());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn manifest_is_rewritten_when_main_class_given() {
        let path = temp_path(".jar");
        let layout = OutputLayout {
            resources: vec![(
                "META-INF/MANIFEST.MF".into(),
                b"Manifest-Version: 1.0\r\nMain-Class: a.Old\r\n".to_vec(),
            )],
            main_class: Some("a.New".into()),
            ..OutputLayout::default()
        };
        assemble(&path, layout).unwrap();
        assert_eq!(
            read_entry(&path, "META-INF/MANIFEST.MF"),
            b"Manifest-Version: 1.0\r\nMain-Class: a.New\r\n"
        );
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn duplicate_names_keep_the_first() {
        let path = temp_path(".jar");
        let mut out = OutputArchive::create(&path).unwrap();
        out.add_file("a.txt", b"first").unwrap();
        out.add_file("a.txt", b"second").unwrap();
        assert_eq!(out.finish().unwrap(), 1);
        assert_eq!(read_entry(&path, "a.txt"), b"first");
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn abandoned_archive_leaves_nothing_behind() {
        let path = temp_path(".jar");
        {
            let mut out = OutputArchive::create(&path).unwrap();
            out.add_file("a.txt", b"data").unwrap();
            assert!(tmp_path(&path).exists());
        }
        assert!(!tmp_path(&path).exists());
        assert!(!path.exists());
    }

    #[test]
    fn input_entries_are_classified() {
        let path = temp_path(".jar");
        let mut out = OutputArchive::create(&path).unwrap();
        out.add_directory("com/").unwrap();
        out.add_file("com/A.class", &[0xCA, 0xFE]).unwrap();
        out.add_file("app.properties", b"k=v").unwrap();
        out.finish().unwrap();

        let entries = read_input(&path).unwrap();
        assert_eq!(
            entries,
            vec![
                InputEntry::Directory("com/".into()),
                InputEntry::Class { name: "com/A.class".into(), bytes: vec![0xCA, 0xFE] },
                InputEntry::Resource { name: "app.properties".into(), bytes: b"k=v".to_vec() },
            ]
        );
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn unreadable_input_is_reported() {
        let missing = temp_path("-missing.jar");
        assert!(matches!(read_input(&missing), Err(Error::InputUnreadable { .. })));
    }
}
