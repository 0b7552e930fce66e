//! Storage transport wiring presented to the emulated machine.
//!
//! Each transport owns its controller id and drive id, so argument sets of two
//! different transports never reference each other's devices.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use clap::ValueEnum;

/// Serial number reported by the emulated NVMe controller.
pub const NVME_SERIAL: &str = "deadbeef";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Transport {
    /// USB mass storage behind an xHCI controller.
    #[value(name = "usb")]
    UsbXhciMassStorage,
    /// USB mass storage behind an EHCI controller.
    #[value(name = "usb-ehci")]
    UsbEhciMassStorage,
    Nvme,
    /// SATA disk behind an AHCI controller.
    Ahci,
    /// SD card behind a PCI SDHCI controller.
    Sdhci,
}

impl Transport {
    pub const ALL: [Transport; 5] = [
        Transport::UsbXhciMassStorage,
        Transport::UsbEhciMassStorage,
        Transport::Nvme,
        Transport::Ahci,
        Transport::Sdhci,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Transport::UsbXhciMassStorage => "usb",
            Transport::UsbEhciMassStorage => "usb-ehci",
            Transport::Nvme => "nvme",
            Transport::Ahci => "ahci",
            Transport::Sdhci => "sdhci",
        }
    }

    /// Drive identifier this transport binds its disk to.
    pub fn drive_id(self) -> &'static str {
        match self {
            Transport::UsbXhciMassStorage => "usbdisk",
            Transport::UsbEhciMassStorage => "ehcidisk",
            Transport::Nvme => "nvmedisk",
            Transport::Ahci => "satadisk",
            Transport::Sdhci => "sddisk",
        }
    }

    pub fn args(self, disk: &Path) -> Vec<String> {
        args_for(self, self.drive_id(), disk)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Transport::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let names: Vec<_> = Transport::ALL.iter().map(|t| t.name()).collect();
                format!("unknown transport `{s}` (expected one of: {})", names.join(", "))
            })
    }
}

/// QEMU splits `-drive` options on commas; a literal comma is written twice.
fn escape_option(value: &str) -> String {
    value.replace(',', ",,")
}

/// Ordered emulator arguments attaching `disk` as a raw drive named
/// `drive_id` behind the controller for `kind`.
pub fn args_for(kind: Transport, drive_id: &str, disk: &Path) -> Vec<String> {
    let drive = format!(
        "if=none,id={drive_id},format=raw,file={}",
        escape_option(&disk.to_string_lossy())
    );
    let (controller, attach) = match kind {
        Transport::UsbXhciMassStorage => (
            Some("qemu-xhci,id=xhci".to_string()),
            format!("usb-storage,bus=xhci.0,drive={drive_id}"),
        ),
        Transport::UsbEhciMassStorage => (
            Some("usb-ehci,id=ehci".to_string()),
            format!("usb-storage,bus=ehci.0,drive={drive_id}"),
        ),
        // The NVMe controller is itself the drive's device.
        Transport::Nvme => (None, format!("nvme,serial={NVME_SERIAL},drive={drive_id}")),
        Transport::Ahci => (
            Some("ahci,id=ahci".to_string()),
            format!("ide-hd,drive={drive_id},bus=ahci.0"),
        ),
        Transport::Sdhci => (
            Some("sdhci-pci,id=sdhci".to_string()),
            format!("sd-card,drive={drive_id}"),
        ),
    };

    let mut args = Vec::with_capacity(6);
    if let Some(controller) = controller {
        args.extend(["-device".to_string(), controller]);
    }
    args.extend(["-drive".to_string(), drive]);
    args.extend(["-device".to_string(), attach]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const DISK: &str = "/tmp/test-disk.img";

    #[test]
    fn usb_profile_wires_drive_through_xhci() {
        assert_eq!(
            Transport::UsbXhciMassStorage.args(Path::new(DISK)),
            [
                "-device",
                "qemu-xhci,id=xhci",
                "-drive",
                "if=none,id=usbdisk,format=raw,file=/tmp/test-disk.img",
                "-device",
                "usb-storage,bus=xhci.0,drive=usbdisk",
            ]
        );
    }

    #[test]
    fn nvme_profile_uses_fixed_serial() {
        assert_eq!(
            Transport::Nvme.args(Path::new(DISK)),
            [
                "-drive",
                "if=none,id=nvmedisk,format=raw,file=/tmp/test-disk.img",
                "-device",
                "nvme,serial=deadbeef,drive=nvmedisk",
            ]
        );
    }

    /// Argument values with the option names filtered out.
    fn values(transport: Transport) -> HashSet<String> {
        transport
            .args(Path::new(DISK))
            .into_iter()
            .filter(|x| x != "-device" && x != "-drive")
            .collect()
    }

    #[test]
    fn profiles_share_no_drive_or_device_references() {
        for a in Transport::ALL {
            for b in Transport::ALL {
                if a == b {
                    continue;
                }
                assert_ne!(a.drive_id(), b.drive_id());
                let a_args = values(a);
                let b_args = values(b);
                assert!(a_args.is_disjoint(&b_args), "{a} and {b} overlap");
                for arg in &a_args {
                    assert!(!arg.contains(b.drive_id()), "{a} references {b}'s drive");
                }
            }
        }
    }

    #[test]
    fn commas_in_disk_paths_are_escaped() {
        let args = Transport::Nvme.args(Path::new("/tmp/a,b.img"));
        assert_eq!(args[1], "if=none,id=nvmedisk,format=raw,file=/tmp/a,,b.img");
    }

    #[test]
    fn parses_cli_names() {
        assert_eq!("usb".parse::<Transport>().unwrap(), Transport::UsbXhciMassStorage);
        assert_eq!("NVMe".parse::<Transport>().unwrap(), Transport::Nvme);
        assert_eq!("usb-ehci".parse::<Transport>().unwrap(), Transport::UsbEhciMassStorage);
        assert!("scsi".parse::<Transport>().unwrap_err().contains("sdhci"));
    }
}
