//! Sample format conversion between the wire and the host.
//!
//! The radio blocks produce complex 16-bit integer samples; hosts usually
//! want complex floats. A [`Converter`] is fixed to one (wire, host) format
//! pair at streamer construction and carries the scale factor, which
//! property propagation adjusts at run time. Wire samples are little-endian
//! within the CHDR payload; host samples are in native byte order.

use crate::args::SampleFormat;
use crate::error::{Error, Result};
#[cfg(test)]
use num_complex::Complex32;

/// Converts samples between a wire format and a host format.
#[derive(Debug, Clone)]
pub struct Converter {
    wire: SampleFormat,
    host: SampleFormat,
    scale: f64,
}

/// Supported conversion pairs, shared by both directions.
fn supported(wire: SampleFormat, host: SampleFormat) -> bool {
    matches!(
        (wire, host),
        (SampleFormat::Sc16, SampleFormat::Fc32)
            | (SampleFormat::Sc16, SampleFormat::Fc64)
            | (SampleFormat::Sc16, SampleFormat::Sc16)
            | (SampleFormat::Fc32, SampleFormat::Fc32)
    )
}

impl Converter {
    /// Creates a receive-side converter (wire to host).
    ///
    /// Unknown format combinations are a construction-time error.
    pub fn rx(wire: SampleFormat, host: SampleFormat) -> Result<Converter> {
        if !supported(wire, host) {
            return Err(Error::Value(format!(
                "no converter from wire format {wire} to host format {host}"
            )));
        }
        let scale = match (wire, host) {
            (SampleFormat::Sc16, SampleFormat::Fc32 | SampleFormat::Fc64) => 1.0 / 32767.0,
            _ => 1.0,
        };
        Ok(Converter { wire, host, scale })
    }

    /// Creates a transmit-side converter (host to wire).
    pub fn tx(host: SampleFormat, wire: SampleFormat) -> Result<Converter> {
        if !supported(wire, host) {
            return Err(Error::Value(format!(
                "no converter from host format {host} to wire format {wire}"
            )));
        }
        let scale = match (host, wire) {
            (SampleFormat::Fc32 | SampleFormat::Fc64, SampleFormat::Sc16) => 32767.0,
            _ => 1.0,
        };
        Ok(Converter { wire, host, scale })
    }

    /// Replaces the scale factor.
    pub fn set_scale(&mut self, scale: f64) {
        self.scale = scale;
    }

    /// Returns the current scale factor.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Size of one wire sample in bytes.
    pub fn bytes_per_wire_item(&self) -> usize {
        self.wire.bytes_per_item()
    }

    /// Size of one host sample in bytes.
    pub fn bytes_per_host_item(&self) -> usize {
        self.host.bytes_per_item()
    }

    /// Converts `nsamps` wire samples into host samples.
    pub fn wire_to_host(&self, wire: &[u8], host: &mut [u8], nsamps: usize) -> Result<()> {
        self.check_bounds(wire.len(), host.len(), nsamps)?;
        match (self.wire, self.host) {
            (SampleFormat::Sc16, SampleFormat::Fc32) => {
                let scale = self.scale as f32;
                for (src, dst) in wire.chunks_exact(4).zip(host.chunks_exact_mut(8)).take(nsamps) {
                    let re = i16::from_le_bytes([src[0], src[1]]) as f32 * scale;
                    let im = i16::from_le_bytes([src[2], src[3]]) as f32 * scale;
                    dst[..4].copy_from_slice(&re.to_ne_bytes());
                    dst[4..].copy_from_slice(&im.to_ne_bytes());
                }
            }
            (SampleFormat::Sc16, SampleFormat::Fc64) => {
                for (src, dst) in wire.chunks_exact(4).zip(host.chunks_exact_mut(16)).take(nsamps) {
                    let re = i16::from_le_bytes([src[0], src[1]]) as f64 * self.scale;
                    let im = i16::from_le_bytes([src[2], src[3]]) as f64 * self.scale;
                    dst[..8].copy_from_slice(&re.to_ne_bytes());
                    dst[8..].copy_from_slice(&im.to_ne_bytes());
                }
            }
            (SampleFormat::Sc16, SampleFormat::Sc16) => {
                for (src, dst) in wire.chunks_exact(4).zip(host.chunks_exact_mut(4)).take(nsamps) {
                    let re = i16::from_le_bytes([src[0], src[1]]);
                    let im = i16::from_le_bytes([src[2], src[3]]);
                    dst[..2].copy_from_slice(&re.to_ne_bytes());
                    dst[2..].copy_from_slice(&im.to_ne_bytes());
                }
            }
            (SampleFormat::Fc32, SampleFormat::Fc32) => {
                let scale = self.scale as f32;
                for (src, dst) in wire.chunks_exact(8).zip(host.chunks_exact_mut(8)).take(nsamps) {
                    let re = f32::from_le_bytes(src[..4].try_into().unwrap()) * scale;
                    let im = f32::from_le_bytes(src[4..].try_into().unwrap()) * scale;
                    dst[..4].copy_from_slice(&re.to_ne_bytes());
                    dst[4..].copy_from_slice(&im.to_ne_bytes());
                }
            }
            _ => unreachable!("constructor rejects unsupported pairs"),
        }
        Ok(())
    }

    /// Converts `nsamps` host samples into wire samples.
    pub fn host_to_wire(&self, host: &[u8], wire: &mut [u8], nsamps: usize) -> Result<()> {
        self.check_bounds(wire.len(), host.len(), nsamps)?;
        match (self.host, self.wire) {
            (SampleFormat::Fc32, SampleFormat::Sc16) => {
                let scale = self.scale as f32;
                for (src, dst) in host.chunks_exact(8).zip(wire.chunks_exact_mut(4)).take(nsamps) {
                    let re = f32::from_ne_bytes(src[..4].try_into().unwrap()) * scale;
                    let im = f32::from_ne_bytes(src[4..].try_into().unwrap()) * scale;
                    dst[..2].copy_from_slice(&(clamp_i16(re)).to_le_bytes());
                    dst[2..].copy_from_slice(&(clamp_i16(im)).to_le_bytes());
                }
            }
            (SampleFormat::Fc64, SampleFormat::Sc16) => {
                for (src, dst) in host.chunks_exact(16).zip(wire.chunks_exact_mut(4)).take(nsamps) {
                    let re = f64::from_ne_bytes(src[..8].try_into().unwrap()) * self.scale;
                    let im = f64::from_ne_bytes(src[8..].try_into().unwrap()) * self.scale;
                    dst[..2].copy_from_slice(&(clamp_i16(re as f32)).to_le_bytes());
                    dst[2..].copy_from_slice(&(clamp_i16(im as f32)).to_le_bytes());
                }
            }
            (SampleFormat::Sc16, SampleFormat::Sc16) => {
                for (src, dst) in host.chunks_exact(4).zip(wire.chunks_exact_mut(4)).take(nsamps) {
                    let re = i16::from_ne_bytes(src[..2].try_into().unwrap());
                    let im = i16::from_ne_bytes(src[2..].try_into().unwrap());
                    dst[..2].copy_from_slice(&re.to_le_bytes());
                    dst[2..].copy_from_slice(&im.to_le_bytes());
                }
            }
            (SampleFormat::Fc32, SampleFormat::Fc32) => {
                let scale = self.scale as f32;
                for (src, dst) in host.chunks_exact(8).zip(wire.chunks_exact_mut(8)).take(nsamps) {
                    let re = f32::from_ne_bytes(src[..4].try_into().unwrap()) * scale;
                    let im = f32::from_ne_bytes(src[4..].try_into().unwrap()) * scale;
                    dst[..4].copy_from_slice(&re.to_le_bytes());
                    dst[4..].copy_from_slice(&im.to_le_bytes());
                }
            }
            _ => unreachable!("constructor rejects unsupported pairs"),
        }
        Ok(())
    }

    fn check_bounds(&self, wire_len: usize, host_len: usize, nsamps: usize) -> Result<()> {
        if wire_len < nsamps * self.bytes_per_wire_item()
            || host_len < nsamps * self.bytes_per_host_item()
        {
            return Err(Error::Value(format!(
                "buffer too small for {nsamps} samples"
            )));
        }
        Ok(())
    }
}

fn clamp_i16(value: f32) -> i16 {
    value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Reads a host-format fc32 buffer back into complex samples. Test helper
/// for code that works with raw byte buffers.
#[cfg(test)]
pub(crate) fn fc32_from_bytes(bytes: &[u8]) -> Vec<Complex32> {
    bytes
        .chunks_exact(8)
        .map(|c| {
            Complex32::new(
                f32::from_ne_bytes(c[..4].try_into().unwrap()),
                f32::from_ne_bytes(c[4..].try_into().unwrap()),
            )
        })
        .collect()
}
