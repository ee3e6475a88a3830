use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

/// Options passed to a device factory by `bus/{id}/add`.
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    pub id_vendor: Option<u16>,
    pub id_product: Option<u16>,
    /// Opaque per-type configuration; parsing is the device's responsibility.
    pub device_specific: serde_json::Map<String, serde_json::Value>,
}

impl DeviceOptions {
    /// Apply the vid/pid overrides to a device's defaults.
    pub fn vid_pid(&self, default_vid: u16, default_pid: u16) -> (u16, u16) {
        (
            self.id_vendor.unwrap_or(default_vid),
            self.id_product.unwrap_or(default_pid),
        )
    }
}

/// A 16-bit id accepted either as a JSON integer in `[0, 65535]` or as a hex
/// string (`"0x12ac"` or bare `"12ac"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HexU16(pub u16);

impl<'de> Deserialize<'de> for HexU16 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HexU16Visitor;

        impl<'de> Visitor<'de> for HexU16Visitor {
            type Value = HexU16;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("an integer in [0, 65535] or a hex string like \"0x12ac\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<HexU16, E> {
                u16::try_from(v)
                    .map(HexU16)
                    .map_err(|_| E::custom(format!("{v} is out of range for a 16-bit id")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<HexU16, E> {
                u16::try_from(v)
                    .map(HexU16)
                    .map_err(|_| E::custom(format!("{v} is out of range for a 16-bit id")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<HexU16, E> {
                let digits = v
                    .strip_prefix("0x")
                    .or_else(|| v.strip_prefix("0X"))
                    .unwrap_or(v);
                if digits.is_empty() {
                    return Err(E::custom("empty hex id"));
                }
                u16::from_str_radix(digits, 16)
                    .map(HexU16)
                    .map_err(|_| E::custom(format!("{v:?} is not a 16-bit hex id")))
            }
        }

        deserializer.deserialize_any(HexU16Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<HexU16, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[test]
    fn accepts_integers_and_hex_strings() {
        assert_eq!(parse("1118").unwrap(), HexU16(1118));
        assert_eq!(parse("\"0x045e\"").unwrap(), HexU16(0x045e));
        assert_eq!(parse("\"0X28DE\"").unwrap(), HexU16(0x28de));
        assert_eq!(parse("\"12ac\"").unwrap(), HexU16(0x12ac));
    }

    #[test]
    fn rejects_out_of_range_and_garbage() {
        assert!(parse("65536").is_err());
        assert!(parse("-1").is_err());
        assert!(parse("\"0x\"").is_err());
        assert!(parse("\"xyz\"").is_err());
        assert!(parse("\"0x12345\"").is_err());
        assert!(parse("true").is_err());
    }
}
