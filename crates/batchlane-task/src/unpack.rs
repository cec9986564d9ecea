//! Zip and tar archive unpacker
//!
//! Lists the entries of an archive. The format is taken from the leading
//! bytes: zip when they carry a local file header, tar otherwise. In remote
//! mode every regular file is uploaded to the output container under its
//! file name, followed by a `<job>-<task>-unpack_log_data.json` record.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use tar::Archive;
use zip::ZipArchive;

use crate::error::TaskResult;
use crate::node::{BlobSink, LogData, TaskEnv};

/// Entries larger than this are skipped
pub const MAX_ENTRY_BYTES: u64 = 512 * 1024 * 1024;

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub path: String,
    pub size: u64,
    pub is_file: bool,
}

/// Sniff the archive format, leaving the reader at its start
pub fn detect_format<R: Read + Seek>(reader: &mut R) -> TaskResult<ArchiveFormat> {
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        match reader.read(&mut magic[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    reader.seek(SeekFrom::Start(0))?;
    Ok(if filled == magic.len() && magic == ZIP_MAGIC {
        ArchiveFormat::Zip
    } else {
        ArchiveFormat::Tar
    })
}

fn log_entry(info: &EntryInfo) {
    println!("archive entry: {} size: {} file: {}", info.path, info.size, info.is_file);
}

fn read_zip<R: Read + Seek>(reader: R) -> TaskResult<Vec<(EntryInfo, Vec<u8>)>> {
    let mut archive = ZipArchive::new(reader)?;
    let mut entries = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let info = EntryInfo {
            path: file.name().to_string(),
            size: file.size(),
            is_file: file.is_file(),
        };
        log_entry(&info);

        let mut data = Vec::new();
        if info.is_file && info.size <= MAX_ENTRY_BYTES {
            file.read_to_end(&mut data)?;
        }
        entries.push((info, data));
    }
    Ok(entries)
}

fn read_tar<R: Read>(reader: R) -> TaskResult<Vec<(EntryInfo, Vec<u8>)>> {
    let mut archive = Archive::new(reader);
    let mut entries = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let info = EntryInfo {
            path: entry.path()?.to_string_lossy().into_owned(),
            size: entry.size(),
            is_file: entry.header().entry_type().is_file(),
        };
        log_entry(&info);

        let mut data = Vec::new();
        if info.is_file && info.size <= MAX_ENTRY_BYTES {
            entry.read_to_end(&mut data)?;
        }
        entries.push((info, data));
    }
    Ok(entries)
}

/// Read the archive and return its entries with file contents
pub fn read_entries<R: Read + Seek>(mut reader: R) -> TaskResult<Vec<(EntryInfo, Vec<u8>)>> {
    match detect_format(&mut reader)? {
        ArchiveFormat::Zip => read_zip(reader),
        ArchiveFormat::Tar => read_tar(reader),
    }
}

/// Upload the regular files of `entries`; returns the uploaded blob names
pub fn run<R: Read + Seek>(reader: R, env: &TaskEnv, sink: Option<&BlobSink>) -> TaskResult<Vec<String>> {
    let entries = read_entries(reader)?;
    let Some(sink) = sink else {
        for (info, data) in &entries {
            if info.is_file {
                println!("dev mode; entry {}: {}", info.path, String::from_utf8_lossy(data));
            }
        }
        println!("dev mode; no result blob processing");
        return Ok(Vec::new());
    };

    let mut log = LogData::new();
    let mut uploaded = Vec::new();
    for (info, data) in &entries {
        log.event(format!("processing entry: {}", info.path));
        if !info.is_file {
            continue;
        }
        if info.size > MAX_ENTRY_BYTES {
            log.event(format!("skipped {}: {} bytes", info.path, info.size));
            tracing::warn!(entry = %info.path, size = info.size, "entry too large");
            continue;
        }
        let Some(blob) = Path::new(&info.path).file_name().map(|n| n.to_string_lossy().into_owned())
        else {
            continue;
        };
        sink.put(&blob, data)?;
        log.event(format!("blob written: {}/{}", sink.container(), blob));
        uploaded.push(blob);
    }
    log.set("entries", entries.len());
    log.set("uploaded", uploaded.len());
    sink.put_text(&env.scoped_name("unpack_log_data.json"), &log.to_json()?)?;
    Ok(uploaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Harness;
    use std::io::{Cursor, Write};
    use tar::{Builder, EntryType, Header};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn tarball(files: &[(&str, &str)]) -> Cursor<Vec<u8>> {
        let mut builder = Builder::new(Vec::new());
        let mut dir = Header::new_gnu();
        dir.set_entry_type(EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_cksum();
        builder.append_data(&mut dir, "data/", std::io::empty()).unwrap();

        for (name, content) in files {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, content.as_bytes()).unwrap();
        }
        Cursor::new(builder.into_inner().unwrap())
    }

    fn zipfile(files: &[(&str, &str)]) -> Cursor<Vec<u8>> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.add_directory("data/", options).unwrap();
        for (name, content) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        let mut cursor = writer.finish().unwrap();
        cursor.set_position(0);
        cursor
    }

    #[test]
    fn test_detect_format() {
        let mut zip = zipfile(&[("data/a.csv", "x,y\n")]);
        assert_eq!(detect_format(&mut zip).unwrap(), ArchiveFormat::Zip);
        assert_eq!(zip.position(), 0);
        let mut tar = tarball(&[("data/a.csv", "x,y\n")]);
        assert_eq!(detect_format(&mut tar).unwrap(), ArchiveFormat::Tar);
        let mut short = Cursor::new(b"PK".to_vec());
        assert_eq!(detect_format(&mut short).unwrap(), ArchiveFormat::Tar);
    }

    #[test]
    fn test_read_tar_entries() {
        let entries = read_entries(tarball(&[("data/a.csv", "x,y\n"), ("data/b.csv", "1,2\n")])).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(!entries[0].0.is_file);
        assert_eq!(entries[1].0.path, "data/a.csv");
        assert_eq!(entries[1].1, b"x,y\n");
    }

    #[test]
    fn test_read_zip_entries() {
        let entries = read_entries(zipfile(&[("data/a.csv", "x,y\n"), ("data/b.csv", "1,2\n")])).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(!entries[0].0.is_file);
        assert_eq!(entries[1].0.path, "data/a.csv");
        assert_eq!(entries[1].0.size, 4);
        assert_eq!(entries[2].1, b"1,2\n");
    }

    #[test]
    fn test_truncated_zip_is_an_error() {
        let mut bytes = zipfile(&[("data/a.csv", "x,y\n")]).into_inner();
        bytes.truncate(bytes.len() / 2);
        assert!(read_entries(Cursor::new(bytes)).is_err());
    }

    #[test]
    fn test_run_uploads_zip_files_and_log() {
        let h = Harness::new();
        let args = h.args(&h.dir.path().join("zips.zip"));
        let sinks = h.sinks(&args);

        let uploaded = run(zipfile(&[("data/a.csv", "x,y\n")]), &h.env, Some(&sinks.output)).unwrap();
        assert_eq!(uploaded, vec!["a.csv".to_string()]);
        assert_eq!(h.store.get_blob_to_text("out", "a.csv").unwrap(), "x,y\n");

        let log = h
            .store
            .get_blob_to_text("out", "states-1-task0-unpack_log_data.json")
            .unwrap();
        assert!(log.contains("processing entry: data/a.csv"));
        assert!(log.contains("\"uploaded\": 1"));
    }

    #[test]
    fn test_run_uploads_tar_files() {
        let h = Harness::new();
        let args = h.args(&h.dir.path().join("zips.tar"));
        let sinks = h.sinks(&args);

        let uploaded = run(tarball(&[("data/b.csv", "1,2\n")]), &h.env, Some(&sinks.output)).unwrap();
        assert_eq!(uploaded, vec!["b.csv".to_string()]);
        assert_eq!(h.store.get_blob_to_text("out", "b.csv").unwrap(), "1,2\n");
    }

    #[test]
    fn test_dev_mode_uploads_nothing() {
        let h = Harness::new();
        assert!(run(zipfile(&[("data/a.csv", "x,y\n")]), &h.env, None).unwrap().is_empty());
        assert!(h.store.list_blobs("out").unwrap().is_empty());
    }
}
