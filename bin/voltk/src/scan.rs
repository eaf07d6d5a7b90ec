//! Physical volume label scanning
//!
//! Reads the first 4 KiB of each candidate device through the batch
//! processor and looks for an LVM2 label in its first four sectors.

use std::path::PathBuf;
use voltk_common::{Error, SECTOR_SIZE};
use voltk_io::{BatchProcessor, IoManager};

/// Bytes read from the start of each device
pub const LABEL_SCAN_SIZE: usize = 4096;

/// Sectors searched for a label
const LABEL_SCAN_SECTORS: usize = 4;

const LABEL_ID: &[u8; 8] = b"LABELONE";

/// Length of a PV identifier
const ID_LEN: usize = 32;

/// A label found on a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    /// Sector holding the label header
    pub sector: u64,
    /// Label type, `LVM2 001` for LVM2 physical volumes
    pub label_type: String,
    /// PV identifier in its dashed display form
    pub pvid: String,
}

/// Outcome of scanning one device
#[derive(Debug)]
pub struct ScanResult {
    pub path: PathBuf,
    pub label: Result<Option<Label>, Error>,
}

/// Scan every device for a label, in the order given
pub fn scan(io: &mut IoManager, devices: &[PathBuf]) -> Vec<ScanResult> {
    let mut batch = BatchProcessor::new();
    for (i, path) in devices.iter().enumerate() {
        batch.add_job(path.clone(), 0, LABEL_SCAN_SIZE, i);
    }

    let mut labels: Vec<Option<Result<Option<Label>, Error>>> =
        devices.iter().map(|_| None).collect();
    let mut found = Vec::new();
    let mut failed = Vec::new();
    batch.exec(
        io,
        |_, i, data| found.push((i, find_label(data))),
        |_, i, e| failed.push((i, e)),
    );
    for (i, label) in found {
        labels[i] = Some(Ok(label));
    }
    for (i, e) in failed {
        labels[i] = Some(Err(e));
    }

    devices
        .iter()
        .zip(labels)
        .map(|(path, label)| ScanResult {
            path: path.clone(),
            label: label.unwrap_or_else(|| Err(Error::internal("job was never run"))),
        })
        .collect()
}

/// Find a label header in the first sectors of `data`.
///
/// Header layout: id (8 bytes), sector number (u64 LE), checksum (u32 LE),
/// offset of the PV header from the label (u32 LE), type (8 bytes). The PV
/// header starts with the 32-byte PV identifier.
pub fn find_label(data: &[u8]) -> Option<Label> {
    let sector_size = SECTOR_SIZE as usize;
    let sectors = (data.len() / sector_size).min(LABEL_SCAN_SECTORS);

    for (sector, raw) in data.chunks_exact(sector_size).take(sectors).enumerate() {
        if &raw[..8] != LABEL_ID {
            continue;
        }
        let sector_xl = u64::from_le_bytes(raw[8..16].try_into().ok()?);
        if sector_xl != sector as u64 {
            continue;
        }
        let offset = u32::from_le_bytes(raw[20..24].try_into().ok()?) as usize;
        let Some(id) = raw.get(offset..offset + ID_LEN) else {
            continue;
        };
        return Some(Label {
            sector: sector as u64,
            label_type: String::from_utf8_lossy(&raw[24..32]).trim_end().to_string(),
            pvid: format_pvid(id),
        });
    }
    None
}

/// Format an identifier the way LVM displays it: 6-4-4-4-4-4-6 groups.
/// Identifiers that are not alphanumeric are shown as hex.
pub fn format_pvid(id: &[u8]) -> String {
    if id.len() != ID_LEN || !id.iter().all(u8::is_ascii_alphanumeric) {
        return hex::encode(id);
    }
    let mut out = String::with_capacity(ID_LEN + 6);
    let mut pos = 0;
    for (i, len) in [6, 4, 4, 4, 4, 4, 6].into_iter().enumerate() {
        if i > 0 {
            out.push('-');
        }
        out.extend(id[pos..pos + len].iter().map(|b| char::from(*b)));
        pos += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;
    use tempfile::{NamedTempFile, TempDir};
    use voltk_common::{EngineKind, IoConfig};

    const PVID: &[u8; 32] = b"Vb3gEnqzZk5cQ1w7JhXy0pLmN2oR4sTu";

    fn label_sector(sector: u64) -> Vec<u8> {
        let mut raw = vec![0u8; 512];
        raw[..8].copy_from_slice(LABEL_ID);
        raw[8..16].copy_from_slice(&sector.to_le_bytes());
        raw[20..24].copy_from_slice(&32u32.to_le_bytes());
        raw[24..32].copy_from_slice(b"LVM2 001");
        raw[32..64].copy_from_slice(PVID);
        raw
    }

    fn manager() -> IoManager {
        IoManager::new(IoConfig {
            engine: EngineKind::Sync,
            sectors_per_block: 8,
            cache_blocks: 8,
            use_direct_io: false,
            ..IoConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_find_label() {
        let mut data = vec![0u8; LABEL_SCAN_SIZE];
        data[512..1024].copy_from_slice(&label_sector(1));
        let label = find_label(&data).unwrap();
        assert_eq!(label.sector, 1);
        assert_eq!(label.label_type, "LVM2 001");
        assert_eq!(label.pvid, "Vb3gEn-qzZk-5cQ1-w7Jh-Xy0p-LmN2-oR4sTu");
    }

    #[test]
    fn test_label_with_wrong_sector_is_ignored() {
        let mut data = vec![0u8; LABEL_SCAN_SIZE];
        data[..512].copy_from_slice(&label_sector(3));
        assert_eq!(find_label(&data), None);
    }

    #[test]
    fn test_label_beyond_fourth_sector_is_ignored() {
        let mut data = vec![0u8; LABEL_SCAN_SIZE];
        data[2048..2560].copy_from_slice(&label_sector(4));
        assert_eq!(find_label(&data), None);
    }

    #[test]
    fn test_format_pvid_falls_back_to_hex() {
        assert_eq!(format_pvid(&[0xAB; 4]), "abababab");
    }

    #[test]
    fn test_scan_devices() {
        let dir = TempDir::new().unwrap();
        let labelled = NamedTempFile::new().unwrap();
        labelled.as_file().write_all_at(&[0u8; 8192], 0).unwrap();
        labelled.as_file().write_all_at(&label_sector(1), 512).unwrap();
        let blank = NamedTempFile::new().unwrap();
        blank.as_file().write_all_at(&[0u8; 8192], 0).unwrap();

        let devices = vec![
            labelled.path().to_path_buf(),
            dir.path().join("gone"),
            blank.path().to_path_buf(),
        ];
        let mut io = manager();
        let results = scan(&mut io, &devices);

        assert_eq!(results.len(), 3);
        let label = results[0].label.as_ref().unwrap().as_ref().unwrap();
        assert_eq!(label.pvid, "Vb3gEn-qzZk-5cQ1-w7Jh-Xy0p-LmN2-oR4sTu");
        assert!(results[1].label.is_err());
        assert!(matches!(results[2].label, Ok(None)));
    }
}
