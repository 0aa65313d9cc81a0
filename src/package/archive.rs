//! Reproducible `tar.gz` archives.

use std::collections::BTreeMap;
use std::io::{self, Read};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType, Header};

/// Packs members in path order with zeroed owners and times.
pub fn write(members: &BTreeMap<String, Vec<u8>>) -> io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    for (path, contents) in members {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        builder.append_data(&mut header, path, contents.as_slice())?;
    }
    builder.into_inner()?.finish()
}

pub fn read(bytes: &[u8]) -> io::Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut members = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut contents = vec![];
        entry.read_to_end(&mut contents)?;
        members.insert(path, contents);
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_is_reproducible() {
        let mut members = BTreeMap::new();
        members.insert("b.txt".to_string(), b"second".to_vec());
        members.insert("a/one.py".to_string(), b"print(1)\n".to_vec());
        let first = write(&members).unwrap();
        let second = write(&members).unwrap();
        assert_eq!(first, second);
        assert_eq!(read(&first).unwrap(), members);
    }
}
