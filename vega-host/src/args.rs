//! Stream and device configuration types.
//!
//! [`DeviceAddr`] is the generic key/value bag that callers use to pass
//! transport-tuning options (frame sizes, buffer sizes, flow-control update
//! rates) down to the link layer. The graph runtime itself does not interpret
//! these keys; they are forwarded verbatim.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Ordered key/value device or stream options.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceAddr(BTreeMap<String, String>);

impl DeviceAddr {
    /// Creates an empty option set.
    pub fn new() -> DeviceAddr {
        DeviceAddr::default()
    }

    /// Sets a key, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    /// Returns the raw value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns whether a key is present.
    pub fn has_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Parses the value for a key, or returns `default` if the key is absent.
    ///
    /// A present but unparseable value is a value error, not a silent
    /// fallback.
    pub fn get_parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.0.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Value(format!("cannot parse option {key}={raw}"))),
        }
    }

    /// Iterates over the keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl FromStr for DeviceAddr {
    type Err = Error;

    /// Parses `"key=value,key=value"` notation. Empty input is an empty set.
    fn from_str(s: &str) -> Result<DeviceAddr> {
        let mut addr = DeviceAddr::new();
        for pair in s.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Value(format!("malformed option `{pair}`")))?;
            addr.set(key.trim(), value.trim());
        }
        Ok(addr)
    }
}

impl std::fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Sample formats understood by the streamers.
///
/// `Sc16` is a complex pair of 16-bit signed integers, the native wire format
/// of the radio blocks. `Fc32`/`Fc64` are complex floats on the host side.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SampleFormat {
    /// Complex signed 16-bit integers.
    Sc16,
    /// Complex 32-bit floats.
    Fc32,
    /// Complex 64-bit floats.
    Fc64,
}

macro_rules! impl_str_conv {
    ($ty:ty, $($s:expr => $v:ident),*) => {
        impl std::str::FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ok(match s {
                    $(
                        $s => <$ty>::$v,
                    )*
                        _ => return Err(Error::Value(
                            format!("unknown sample format `{s}`"))),
                })
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", match self {
                    $(
                        <$ty>::$v => $s,
                    )*
                })
            }
        }
    }
}

impl_str_conv!(SampleFormat, "sc16" => Sc16, "fc32" => Fc32, "fc64" => Fc64);

impl SampleFormat {
    /// Size of one complex item in bytes.
    pub fn bytes_per_item(self) -> usize {
        match self {
            SampleFormat::Sc16 => 4,
            SampleFormat::Fc32 => 8,
            SampleFormat::Fc64 => 16,
        }
    }

    /// Bit width of one item component (real or imaginary part).
    pub fn item_comp_bit_width(self) -> usize {
        self.bytes_per_item() * 8 / 2
    }
}

/// Arguments for creating a streamer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StreamArgs {
    /// Host-side sample format.
    pub cpu_format: SampleFormat,
    /// Over-the-wire sample format.
    pub otw_format: SampleFormat,
    /// Samples per packet; `None` derives it from the link payload size.
    pub spp: Option<usize>,
    /// Additional options, forwarded to the link layer verbatim.
    pub args: DeviceAddr,
}

impl StreamArgs {
    /// Creates stream args with the given formats and no extra options.
    pub fn new(cpu_format: SampleFormat, otw_format: SampleFormat) -> StreamArgs {
        StreamArgs {
            cpu_format,
            otw_format,
            spp: None,
            args: DeviceAddr::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn device_addr_parse_and_display() {
        let addr: DeviceAddr = "recv_frame_size=8192, num_recv_frames=64".parse().unwrap();
        assert_eq!(addr.get("recv_frame_size"), Some("8192"));
        assert_eq!(addr.get_parsed("num_recv_frames", 0usize).unwrap(), 64);
        assert_eq!(addr.get_parsed("missing", 7usize).unwrap(), 7);
        assert_eq!(addr.to_string(), "num_recv_frames=64,recv_frame_size=8192");
    }

    #[test]
    fn device_addr_bad_value_is_value_error() {
        let addr: DeviceAddr = "spp=banana".parse().unwrap();
        assert!(matches!(
            addr.get_parsed::<usize>("spp", 0),
            Err(Error::Value(_))
        ));
        assert!(matches!("justakey".parse::<DeviceAddr>(), Err(Error::Value(_))));
    }

    #[test]
    fn sample_format_strings() {
        assert_eq!("sc16".parse::<SampleFormat>().unwrap(), SampleFormat::Sc16);
        assert_eq!(SampleFormat::Fc32.to_string(), "fc32");
        assert!("q8".parse::<SampleFormat>().is_err());
    }
}
