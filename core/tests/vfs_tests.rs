// End-to-end tests of the engine through its public API, using
// image files on disk

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use strata_core::{
    Block, Decoder, DirectoryEntry, DiskExt, DiskRef, FilesystemInfo, FilesystemView, FnDecoder,
    FnSink, ImageDisk, Layout, Registry, ScanEvent, StrataError, Vfs, VfsState, ATTR_FS_IMPLEMENTATION,
    ATTR_FS_OFFSET,
};
use tempfile::NamedTempFile;

const SECTOR: u64 = 512;

/// Create an image file: a magic header in sector 0 describing
/// "partitions" as (start sector, sector count) pairs
fn create_test_image(partitions: &[(u32, u32)], sectors: u64) -> NamedTempFile {
    let mut data = vec![0u8; (sectors * SECTOR) as usize];
    data[..4].copy_from_slice(b"TPT1");
    data[4] = partitions.len() as u8;
    for (i, (start, count)) in partitions.iter().enumerate() {
        let at = 8 + i * 8;
        data[at..at + 4].copy_from_slice(&start.to_le_bytes());
        data[at + 4..at + 8].copy_from_slice(&count.to_le_bytes());
        // Each partition carries a volume label right after a "VOL:" tag
        let base = (*start as u64 * SECTOR) as usize;
        data[base..base + 4].copy_from_slice(b"VOL:");
        let label = format!("PART{}", i + 1);
        data[base + 4..base + 4 + label.len()].copy_from_slice(label.as_bytes());
    }

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();
    file
}

/// Partition table decoder for the toy "TPT1" format
fn table_decoder() -> Arc<dyn Decoder> {
    Arc::new(FnDecoder::new(
        "tpt",
        |block: &Block, out: &mut Vec<Block>, _: &[&Block]| {
            let reader = block.new_reader();
            if reader.size() < SECTOR || reader.read_vec_at(0, 4)? != b"TPT1" {
                return Ok(false);
            }
            let header = reader.read_vec_at(0, SECTOR as usize)?;
            for i in 0..header[4] as usize {
                let at = 8 + i * 8;
                let start = u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
                let count =
                    u32::from_le_bytes([header[at + 4], header[at + 5], header[at + 6], header[at + 7]]);
                out.push(
                    Block::slice(block, start as u64 * SECTOR, count as u64 * SECTOR, "partition")?
                        .with_attribute("partition.index", i as u64),
                );
            }
            Ok(true)
        },
    ))
}

/// Recognises "VOL:" partitions as filesystems
fn volume_decoder() -> Arc<dyn Decoder> {
    Arc::new(FnDecoder::new(
        "vol",
        |block: &Block, out: &mut Vec<Block>, _: &[&Block]| {
            if block.block_type() != "partition" {
                return Ok(false);
            }
            let reader = block.new_reader();
            if reader.read_vec_at(0, 4)? != b"VOL:" {
                return Ok(false);
            }
            out.push(
                Block::slice(block, 0, block.size(), "filesystem")?
                    .with_attribute(ATTR_FS_IMPLEMENTATION, "vol")
                    .with_attribute(ATTR_FS_OFFSET, 4u64),
            );
            Ok(true)
        },
    ))
}

struct LabelFilesystem {
    label: String,
    total_bytes: u64,
}

impl FilesystemView for LabelFilesystem {
    fn filesystem_type(&self) -> &str {
        "vol"
    }

    fn info(&self) -> FilesystemInfo {
        FilesystemInfo {
            filesystem_type: "vol".to_string(),
            volume_label: Some(self.label.clone()),
            volume_serial: None,
            total_bytes: self.total_bytes,
            cluster_size: None,
        }
    }

    fn root_directory(&self) -> strata_core::Result<Vec<DirectoryEntry>> {
        Ok(vec![DirectoryEntry {
            name: format!("{}.TXT", self.label),
            size: 0,
            is_directory: false,
        }])
    }
}

fn registry() -> Arc<Registry> {
    let mut registry = Registry::new();
    registry.register_decoder(table_decoder());
    registry.register_decoder(volume_decoder());
    registry.register_filesystem("vol", |reader, offset| {
        let raw = reader.read_vec_at(offset, 5)?;
        let label = String::from_utf8_lossy(&raw).to_string();
        Ok(Box::new(LabelFilesystem {
            label,
            total_bytes: reader.size(),
        }))
    });
    Arc::new(registry)
}

fn open(file: &NamedTempFile) -> DiskRef {
    Arc::new(ImageDisk::open(file.path()).unwrap())
}

#[test]
fn test_scan_image_with_two_partitions() {
    let image = create_test_image(&[(1, 4), (5, 2)], 8);
    let vfs = Vfs::new(registry());
    vfs.add_disk(open(&image)).unwrap();
    assert!(vfs.is_available().unwrap());

    let graph = vfs.blocks().unwrap();
    // disk, 2 partitions, 2 filesystems
    assert_eq!(graph.len(), 5);
    assert_eq!(graph.passes(), 3);
    assert_eq!(graph.by_type("partition").count(), 2);
    assert_eq!(graph.children_of(1).unwrap().len(), 2);
    assert_eq!(graph.block(2).unwrap().size(), 4 * SECTOR);
    assert!(graph.unhandled().all(|b| b.block_type() == "filesystem"));

    let roots = vfs.root_entries().unwrap();
    let labels: Vec<(String, Option<String>)> = roots
        .iter()
        .map(|r| (r.name().to_string(), r.filesystem().info().volume_label))
        .collect();
    assert_eq!(
        labels,
        vec![
            ("FS01".to_string(), Some("PART1".to_string())),
            ("FS02".to_string(), Some("PART2".to_string())),
        ]
    );
    assert_eq!(roots[1].filesystem().root_directory().unwrap()[0].name, "PART2.TXT");
}

#[test]
fn test_partition_layout_maps_onto_disk() {
    let image = create_test_image(&[(2, 3)], 8);
    let vfs = Vfs::new(registry());
    vfs.add_disk(open(&image)).unwrap();
    let graph = vfs.blocks().unwrap();

    let fs = graph.by_type("filesystem").next().unwrap();
    assert_eq!(
        fs.layout(),
        Layout::Extents {
            extents: vec![strata_core::Extent {
                disk: 0,
                offset: 2 * SECTOR,
                length: 3 * SECTOR,
            }],
        }
    );
    let mut tag = [0u8; 9];
    fs.new_reader().read_exact(&mut tag).unwrap();
    assert_eq!(&tag, b"VOL:PART1");
}

#[test]
fn test_image_without_structure_yields_bare_root() {
    let mut blank = NamedTempFile::new().unwrap();
    blank.write_all(&[0u8; 2048]).unwrap();
    blank.flush().unwrap();

    let vfs = Vfs::new(registry());
    vfs.add_disk(open(&blank)).unwrap();
    let graph = vfs.blocks().unwrap();
    assert_eq!(graph.len(), 1);
    assert!(!graph.block(1).unwrap().is_handled());
    assert!(vfs.root_entries().unwrap().is_empty());
}

#[test]
fn test_save_and_reload_without_decoding() {
    let image = create_test_image(&[(1, 4), (5, 2)], 8);
    let state_file = NamedTempFile::new().unwrap();

    let vfs = Vfs::new(registry());
    vfs.add_disk(open(&image)).unwrap();
    let original = vfs.blocks().unwrap();
    vfs.state().unwrap().save(state_file.path()).unwrap();

    let offered = Arc::new(Mutex::new(0usize));
    let counting = Arc::clone(&offered);
    let mut registry = Registry::new();
    registry.register_decoder(Arc::new(FnDecoder::new(
        "count",
        move |_: &Block, _: &mut Vec<Block>, _: &[&Block]| {
            *counting.lock().unwrap() += 1;
            Ok(false)
        },
    )));
    registry.register_filesystem("vol", |reader, _| {
        Ok(Box::new(LabelFilesystem {
            label: "RELOADED".to_string(),
            total_bytes: reader.size(),
        }))
    });

    let state = VfsState::load(state_file.path()).unwrap();
    assert_eq!(state.version, strata_core::STATE_VERSION);
    assert!(state.saved_at.is_some());
    let reloaded = Vfs::from_state(&state, Arc::new(registry)).unwrap();
    let graph = reloaded.blocks().unwrap();

    assert_eq!(*offered.lock().unwrap(), 0);
    assert_eq!(graph.len(), original.len());
    for (a, b) in original.iter().zip(graph.iter()) {
        assert_eq!(a.state(), b.state());
    }
    // Layouts were rebound to the reopened image
    assert_eq!(reloaded.root_entries().unwrap().len(), 2);
}

#[test]
fn test_state_with_missing_image_reloads_detached() {
    let image = create_test_image(&[(1, 4)], 8);
    let vfs = Vfs::new(registry());
    vfs.add_disk(open(&image)).unwrap();
    let json = vfs.state().unwrap().to_json().unwrap();
    drop(vfs);
    image.close().unwrap();

    let reloaded = Vfs::from_state(&VfsState::from_json(&json).unwrap(), registry()).unwrap();
    assert!(!reloaded.is_available().unwrap());
    let graph = reloaded.blocks().unwrap();
    assert_eq!(graph.len(), 3);
    assert!(graph.iter().all(|b| !b.is_available()));

    let disks = reloaded.disks().unwrap();
    let err = disks[0].new_reader().read_vec_at(0, 4).unwrap_err();
    assert!(matches!(err, StrataError::Unavailable(_)));
}

#[test]
fn test_unknown_state_version_is_rejected() {
    let mut state = Vfs::new(registry()).state().unwrap();
    state.version = 2;
    let json = state.to_json().unwrap();
    let result = Vfs::from_state(&VfsState::from_json(&json).unwrap(), registry());
    assert!(matches!(result, Err(StrataError::NotSupported(_))));
}

#[test]
fn test_events_reach_function_sinks() {
    let image = create_test_image(&[(1, 4)], 8);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);

    let vfs = Vfs::new(registry());
    vfs.subscribe(Arc::new(FnSink::new(move |event: &ScanEvent| {
        sink_seen.lock().unwrap().push(event.clone());
    })));
    vfs.add_disk(open(&image)).unwrap();
    vfs.root_entries().unwrap();

    let seen = seen.lock().unwrap();
    assert!(matches!(seen.first(), Some(ScanEvent::ScanStarted { disks: 1 })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, ScanEvent::RootEntryMounted { name, uid: 3 } if name == "FS01")));
}

#[test]
fn test_disk_reader_is_independent_per_call() {
    let image = create_test_image(&[(1, 4)], 8);
    let disk = open(&image);
    let mut a = disk.new_reader();
    let mut b = disk.new_reader();

    let mut first = [0u8; 4];
    a.read_exact(&mut first).unwrap();
    assert_eq!(&first, b"TPT1");
    assert_eq!(a.position(), 4);
    assert_eq!(b.position(), 0);
    b.read_exact(&mut first).unwrap();
    assert_eq!(&first, b"TPT1");
}
