//! Storage volume extraction from libvirt domain XML.
//!
//! Only `<disk>` elements directly under `<devices>` are considered, and only
//! their direct `<source file='...'/>` child. Backing chains
//! (`<backingStore><source .../>`) are ignored on purpose: the top image is
//! what the guest writes to.

use std::path::PathBuf;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use crate::error::{HypervisorError, Result};

/// Disk element currently being read.
struct OpenDisk {
    device: String,
    file: Option<PathBuf>,
    other_source: bool,
}

/// Extract the backing files of a domain's disks, in document order.
///
/// Read-only media (`device='cdrom'`, `device='floppy'`) and disks backed by
/// block devices, network or pool volumes are skipped.
pub fn disk_source_files(xml: &str) -> Result<Vec<PathBuf>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut disk: Option<OpenDisk> = None;
    let mut files = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                handle_element(&path, &e, &mut disk)?;
                path.push(e.name().as_ref().to_vec());
            }
            Ok(Event::Empty(e)) => {
                handle_element(&path, &e, &mut disk)?;
                // A self-closing <disk/> has no source.
                if is_devices_path(&path) && e.name().as_ref() == b"disk" {
                    disk = None;
                }
            }
            Ok(Event::End(e)) => {
                path.pop();
                if e.name().as_ref() == b"disk" && is_devices_path(&path) {
                    if let Some(done) = disk.take() {
                        collect(done, &mut files);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(HypervisorError::XmlError(format!(
                    "at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    if !path.is_empty() {
        return Err(HypervisorError::XmlError("unexpected end of document".to_string()));
    }

    Ok(files)
}

fn is_devices_path(path: &[Vec<u8>]) -> bool {
    path.len() == 2 && path[0] == b"domain" && path[1] == b"devices"
}

fn handle_element(path: &[Vec<u8>], e: &BytesStart<'_>, disk: &mut Option<OpenDisk>) -> Result<()> {
    let name = e.name();
    if is_devices_path(path) && name.as_ref() == b"disk" {
        let device = attribute(e, "device")?.unwrap_or_else(|| "disk".to_string());
        *disk = Some(OpenDisk {
            device,
            file: None,
            other_source: false,
        });
        return Ok(());
    }

    let in_disk = path.len() == 3 && is_devices_path(&path[..2]) && path[2] == b"disk";
    if in_disk && name.as_ref() == b"source" {
        if let Some(open) = disk.as_mut() {
            match attribute(e, "file")? {
                Some(file) => open.file = Some(PathBuf::from(file)),
                None => open.other_source = true,
            }
        }
    }
    Ok(())
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Result<Option<String>> {
    let attr = e
        .try_get_attribute(key)
        .map_err(|err| HypervisorError::XmlError(err.to_string()))?;
    match attr {
        Some(attr) => {
            let value = attr
                .unescape_value()
                .map_err(|err| HypervisorError::XmlError(err.to_string()))?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

fn collect(disk: OpenDisk, files: &mut Vec<PathBuf>) {
    if disk.device != "disk" {
        debug!(device = %disk.device, file = ?disk.file, "Skipping removable media");
        return;
    }
    match disk.file {
        Some(file) => files.push(file),
        None if disk.other_source => {
            debug!("Skipping disk without a file source");
        }
        None => {
            debug!("Skipping disk with no source");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = r#"
<domain type='kvm'>
  <name>db_vm</name>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/db_vm.qcow2'/>
      <backingStore type='file'>
        <source file='/var/lib/libvirt/images/base.qcow2'/>
      </backingStore>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <source file='/srv/iso/install.iso'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <disk type='block' device='disk'>
      <source dev='/dev/zvol/tank/db_data'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <disk type='file'>
      <source file='/var/lib/libvirt/images/db&amp;logs.raw'/>
      <target dev='vdc' bus='virtio'/>
    </disk>
  </devices>
</domain>
"#;

    #[test]
    fn test_extracts_file_disks_in_order() {
        let files = disk_source_files(DOMAIN).unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("/var/lib/libvirt/images/db_vm.qcow2"),
                PathBuf::from("/var/lib/libvirt/images/db&logs.raw"),
            ]
        );
    }

    #[test]
    fn test_domain_without_disks() {
        let xml = "<domain><name>empty</name><devices><disk/></devices></domain>";
        assert!(disk_source_files(xml).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_xml() {
        let result = disk_source_files("<domain><devices><disk></devices></domain>");
        assert!(matches!(result, Err(HypervisorError::XmlError(_))));
    }
}
