//! Cross-check of driver-reported device identities.
use std::collections::HashSet;

use thiserror::Error;

use crate::remote::DeviceIdentity;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("{got} devices reported, {expected} claimed")]
    CountMismatch { expected: usize, got: usize },
    #[error("device {gpu_id} has a blank {field}")]
    Blank { gpu_id: u32, field: &'static str },
    #[error("{field} {value} reported by more than one device")]
    Duplicate { field: &'static str, value: String },
}

fn is_blank(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value.eq_ignore_ascii_case("[n/a]") || value.eq_ignore_ascii_case("n/a")
}

/// Check that `devices` are `expected` distinct physical GPUs.
pub fn check(devices: &[DeviceIdentity], expected: usize) -> Result<(), IdentityError> {
    if devices.len() != expected {
        return Err(IdentityError::CountMismatch {
            expected,
            got: devices.len(),
        });
    }
    let fields: [(&'static str, fn(&DeviceIdentity) -> &str); 3] = [
        ("uuid", |d| d.uuid.as_str()),
        ("serial", |d| d.serial.as_str()),
        ("pci bus id", |d| d.pci_bus_id.as_str()),
    ];
    for (field, get) in fields {
        let mut seen = HashSet::new();
        for device in devices {
            let value = get(device).trim();
            if is_blank(value) {
                return Err(IdentityError::Blank {
                    gpu_id: device.gpu_id,
                    field,
                });
            }
            if !seen.insert(value.to_ascii_lowercase()) {
                return Err(IdentityError::Duplicate {
                    field,
                    value: value.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: u32) -> DeviceIdentity {
        DeviceIdentity {
            gpu_id: id,
            uuid: format!("GPU-{id:04}"),
            serial: format!("13200{id}"),
            pci_bus_id: format!("00000000:0{id}:00.0"),
        }
    }

    #[test]
    fn distinct_devices_pass() {
        assert_eq!(Ok(()), check(&[device(0), device(1)], 2));
    }

    #[test]
    fn count_mismatch() {
        assert_eq!(
            Err(IdentityError::CountMismatch { expected: 3, got: 2 }),
            check(&[device(0), device(1)], 3)
        );
    }

    #[test]
    fn duplicates() {
        let mut copy = device(1);
        copy.uuid = device(0).uuid;
        assert!(matches!(
            check(&[device(0), copy], 2),
            Err(IdentityError::Duplicate { field: "uuid", .. })
        ));
    }

    #[test]
    fn blanks() {
        let mut blank = device(1);
        blank.serial = "[N/A]".into();
        assert_eq!(
            Err(IdentityError::Blank {
                gpu_id: 1,
                field: "serial"
            }),
            check(&[device(0), blank], 2)
        );
    }
}
