/// Outcome of scanning a harvested buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Valid,
    /// Byte offset into the buffer of the first bad sentinel.
    Corrupted { offset: usize },
}

/// Checks that the last byte of every `stride`-wide record equals `sentinel`.
///
/// Stops at the first mismatch. A trailing partial record counts as
/// corruption at its first byte; a zero stride is corrupt at offset 0.
pub fn validate(buffer: &[u8], stride: usize, sentinel: u8) -> Validation {
    if stride == 0 {
        return Validation::Corrupted { offset: 0 };
    }

    for (i, record) in buffer.chunks(stride).enumerate() {
        let start = i * stride;
        if record.len() < stride {
            return Validation::Corrupted { offset: start };
        }
        if record[stride - 1] != sentinel {
            return Validation::Corrupted {
                offset: start + stride - 1,
            };
        }
    }
    Validation::Valid
}

/// Drops the sentinel byte of every record, keeping payload order.
pub fn strip_sentinels(buffer: &[u8], stride: usize) -> Vec<u8> {
    if stride == 0 {
        return Vec::new();
    }
    let mut payload = Vec::with_capacity(buffer.len() / stride * (stride - 1));
    for record in buffer.chunks_exact(stride) {
        payload.extend_from_slice(&record[..stride - 1]);
    }
    payload
}
