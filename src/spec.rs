//! Built-in service specifications.
//!
//! Role declarations (`roles.button()`) and role member accesses
//! (`thermo.temperature`) resolve against these tables. Class identifiers
//! live in the `0x1` (primary) and `0x2` (mixin) namespaces; the image
//! serializer and the verifier both insist on that.

use crate::format::OpFmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Read-only register
    ReadOnly,
    /// Read-write register
    ReadWrite,
    /// Constant register
    Const,
    Event,
}

impl PacketKind {
    pub fn is_register(self) -> bool {
        !matches!(self, Self::Event)
    }
}

/// One field of a register or event payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketField {
    pub name: &'static str,
    /// Payload bytes; negative for signed integers, `0x10 | bytes` for
    /// IEEE floats
    pub storage: i8,
    /// Fixed-point fractional bits
    pub shift: u8,
}

impl PacketField {
    /// Buffer access format for this field.
    pub fn numfmt(&self) -> Option<OpFmt> {
        Some(match self.storage {
            1 => OpFmt::U8,
            2 => OpFmt::U16,
            4 => OpFmt::U32,
            8 => OpFmt::U64,
            -1 => OpFmt::I8,
            -2 => OpFmt::I16,
            -4 => OpFmt::I32,
            -8 => OpFmt::I64,
            0x14 => OpFmt::F32,
            0x18 => OpFmt::F64,
            _ => return None,
        })
    }

    pub fn size(&self) -> u32 {
        (self.storage.abs() as u32) & 0xf
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketSpec {
    pub name: &'static str,
    pub kind: PacketKind,
    pub identifier: u16,
    pub fields: &'static [PacketField],
}

impl PacketSpec {
    pub fn total_size(&self) -> u32 {
        self.fields.iter().map(|f| f.size()).sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceSpec {
    pub name: &'static str,
    pub class_id: u32,
    pub packets: &'static [PacketSpec],
}

impl ServiceSpec {
    /// Look a member name up in this service, falling back to the shared
    /// system packets so every role carries status-style members.
    pub fn lookup(&self, name: &str) -> Option<&'static PacketSpec> {
        self.packets
            .iter()
            .find(|p| p.name == name)
            .or_else(|| SYSTEM.packets.iter().find(|p| p.name == name))
    }
}

const READING_REG: u16 = 0x101;

/// Shared packets every service implicitly carries.
pub static SYSTEM: ServiceSpec = ServiceSpec {
    name: "_system",
    class_id: 0x1fff_ffff,
    packets: &[
        PacketSpec {
            name: "statusCode",
            kind: PacketKind::ReadOnly,
            identifier: 0x103,
            fields: &[
                PacketField {
                    name: "code",
                    storage: 2,
                    shift: 0,
                },
                PacketField {
                    name: "vendorCode",
                    storage: 2,
                    shift: 0,
                },
            ],
        },
        PacketSpec {
            name: "statusCodeChanged",
            kind: PacketKind::Event,
            identifier: 0x4,
            fields: &[],
        },
    ],
};

pub static SERVICES: &[ServiceSpec] = &[
    ServiceSpec {
        name: "button",
        class_id: 0x1473_a263,
        packets: &[
            PacketSpec {
                name: "down",
                kind: PacketKind::Event,
                identifier: 0x1,
                fields: &[],
            },
            PacketSpec {
                name: "up",
                kind: PacketKind::Event,
                identifier: 0x2,
                fields: &[],
            },
            PacketSpec {
                name: "hold",
                kind: PacketKind::Event,
                identifier: 0x81,
                fields: &[],
            },
        ],
    },
    ServiceSpec {
        name: "temperature",
        class_id: 0x1421_bac7,
        packets: &[PacketSpec {
            name: "temperature",
            kind: PacketKind::ReadOnly,
            identifier: READING_REG,
            fields: &[PacketField {
                name: "temperature",
                storage: -4,
                shift: 10,
            }],
        }],
    },
    ServiceSpec {
        name: "humidity",
        class_id: 0x16c8_10b8,
        packets: &[PacketSpec {
            name: "humidity",
            kind: PacketKind::ReadOnly,
            identifier: READING_REG,
            fields: &[PacketField {
                name: "humidity",
                storage: 4,
                shift: 10,
            }],
        }],
    },
    ServiceSpec {
        name: "potentiometer",
        class_id: 0x1f27_4746,
        packets: &[PacketSpec {
            name: "position",
            kind: PacketKind::ReadOnly,
            identifier: READING_REG,
            fields: &[PacketField {
                name: "position",
                storage: 2,
                shift: 16,
            }],
        }],
    },
    ServiceSpec {
        name: "lightBulb",
        class_id: 0x1cab_054c,
        packets: &[PacketSpec {
            name: "brightness",
            kind: PacketKind::ReadWrite,
            identifier: 0x1,
            fields: &[PacketField {
                name: "brightness",
                storage: 2,
                shift: 16,
            }],
        }],
    },
    ServiceSpec {
        name: "accelerometer",
        class_id: 0x1f14_0409,
        packets: &[
            PacketSpec {
                name: "forces",
                kind: PacketKind::ReadOnly,
                identifier: READING_REG,
                fields: &[
                    PacketField {
                        name: "x",
                        storage: -4,
                        shift: 20,
                    },
                    PacketField {
                        name: "y",
                        storage: -4,
                        shift: 20,
                    },
                    PacketField {
                        name: "z",
                        storage: -4,
                        shift: 20,
                    },
                ],
            },
            PacketSpec {
                name: "maxForce",
                kind: PacketKind::Const,
                identifier: 0x180,
                fields: &[PacketField {
                    name: "maxForce",
                    storage: 4,
                    shift: 20,
                }],
            },
        ],
    },
];

/// Resolve a `roles.<name>()` service name.
pub fn service_by_name(name: &str) -> Option<&'static ServiceSpec> {
    SERVICES.iter().find(|s| s.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_id_namespaces() {
        for spec in SERVICES {
            let top = spec.class_id >> 28;
            assert!(top == 0x1 || top == 0x2, "{} class {:#x}", spec.name, spec.class_id);
        }
    }

    #[test]
    fn system_fallback() {
        let button = service_by_name("button").unwrap();
        assert!(button.lookup("down").is_some());
        let status = button.lookup("statusCode").unwrap();
        assert_eq!(status.identifier, 0x103);
        assert_eq!(status.total_size(), 4);
    }

    #[test]
    fn field_formats() {
        let temp = service_by_name("temperature").unwrap();
        let reg = temp.lookup("temperature").unwrap();
        assert_eq!(reg.fields[0].numfmt(), Some(OpFmt::I32));
        assert_eq!(reg.fields[0].shift, 10);
    }

    #[test]
    fn unknown_names() {
        assert!(service_by_name("toaster").is_none());
        let temp = service_by_name("temperature").unwrap();
        assert!(temp.lookup("pressure").is_none());
    }
}
