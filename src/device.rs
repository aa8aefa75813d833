//! `TAG=value` device references (spec §4.B), e.g. `UUID=...`,
//! `PARTUUID=...`, `LABEL=...`, `PARTLABEL=...`, matched against a
//! filesystem's bag of identifiers.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceTag {
    Uuid,
    PartUuid,
    Label,
    PartLabel,
    /// A verbatim device path, e.g. `/dev/sda1`, not a `TAG=value` spec.
    Device,
}

impl DeviceTag {
    pub fn name(self) -> &'static str {
        match self {
            DeviceTag::Uuid => "UUID",
            DeviceTag::PartUuid => "PARTUUID",
            DeviceTag::Label => "LABEL",
            DeviceTag::PartLabel => "PARTLABEL",
            DeviceTag::Device => "DEVICE",
        }
    }
}

/// A parsed device reference: either a recognised tag plus value, or a
/// verbatim device path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSpec {
    pub tag: DeviceTag,
    pub value: String,
}

impl DeviceSpec {
    pub fn parse(s: &str) -> Self {
        for (prefix, tag) in [
            ("UUID=", DeviceTag::Uuid),
            ("PARTUUID=", DeviceTag::PartUuid),
            ("LABEL=", DeviceTag::Label),
            ("PARTLABEL=", DeviceTag::PartLabel),
        ] {
            if let Some(value) = s.strip_prefix(prefix) {
                return Self {
                    tag,
                    value: value.to_string(),
                };
            }
        }
        Self {
            tag: DeviceTag::Device,
            value: s.to_string(),
        }
    }
}

/// A filesystem's bag of identifiers; any field may be empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identifiers {
    pub device: String,
    pub uuid: String,
    pub part_uuid: String,
    pub label: String,
    pub part_label: String,
}

impl Identifiers {
    fn field(&self, tag: DeviceTag) -> &str {
        match tag {
            DeviceTag::Uuid => &self.uuid,
            DeviceTag::PartUuid => &self.part_uuid,
            DeviceTag::Label => &self.label,
            DeviceTag::PartLabel => &self.part_label,
            DeviceTag::Device => &self.device,
        }
    }

    /// True iff the corresponding identifier is non-empty and equal to
    /// `spec`'s value.
    pub fn matches(&self, spec: &DeviceSpec) -> bool {
        let field = self.field(spec.tag);
        !field.is_empty() && field == spec.value
    }

    /// The first non-empty of UUID, PARTUUID, LABEL, PARTLABEL, else
    /// the device path.
    pub fn best_identifier(&self) -> String {
        for tag in [
            DeviceTag::Uuid,
            DeviceTag::PartUuid,
            DeviceTag::Label,
            DeviceTag::PartLabel,
        ] {
            let f = self.field(tag);
            if !f.is_empty() {
                return format!("{}={}", tag.name(), f);
            }
        }
        self.device.clone()
    }

    /// The tag name of whichever field `best_identifier` picked, or
    /// `"DEVICE"` if none are set.
    pub fn identifier_type(&self) -> &'static str {
        for tag in [
            DeviceTag::Uuid,
            DeviceTag::PartUuid,
            DeviceTag::Label,
            DeviceTag::PartLabel,
        ] {
            if !self.field(tag).is_empty() {
                return tag.name();
            }
        }
        DeviceTag::Device.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> Identifiers {
        Identifiers {
            device: "/dev/sda2".into(),
            uuid: "1111-2222".into(),
            part_uuid: String::new(),
            label: "root".into(),
            part_label: String::new(),
        }
    }

    #[test]
    fn parse_known_tags() {
        assert_eq!(DeviceSpec::parse("UUID=abcd").tag, DeviceTag::Uuid);
        assert_eq!(DeviceSpec::parse("LABEL=root").tag, DeviceTag::Label);
        assert_eq!(DeviceSpec::parse("/dev/sda1").tag, DeviceTag::Device);
    }

    #[test]
    fn matches_requires_non_empty_field() {
        let identifiers = ids();
        assert!(identifiers.matches(&DeviceSpec::parse("UUID=1111-2222")));
        assert!(!identifiers.matches(&DeviceSpec::parse("PARTUUID=1111-2222")));
        assert!(!identifiers.matches(&DeviceSpec::parse("UUID=0000")));
    }

    #[test]
    fn best_identifier_prefers_uuid_then_partuuid_then_label() {
        let identifiers = ids();
        assert_eq!(identifiers.best_identifier(), "UUID=1111-2222");
        assert_eq!(identifiers.identifier_type(), "UUID");

        let mut no_uuid = identifiers.clone();
        no_uuid.uuid.clear();
        assert_eq!(no_uuid.best_identifier(), "LABEL=root");

        let bare = Identifiers {
            device: "/dev/sda2".into(),
            ..Default::default()
        };
        assert_eq!(bare.best_identifier(), "/dev/sda2");
        assert_eq!(bare.identifier_type(), "DEVICE");
    }
}
