//! ULEB128 变长整数编解码。
//!
//! # 模块定位（Why）
//! - 每个块（block）以 `ULEB128(payload_len)` 作为长度前缀，小块只需 1 字节头部；
//! - 块可能跨越两个物理分块（chunk），读取端需要逐字节喂入的增量解码器，
//!   因而同时提供一次性解码与 [`Uleb128Reader`] 状态机。
//!
//! # 编码格式（What）
//! - 低 7 位在前；除最后一个字节外，其余字节最高位置 1 作为续位标记；
//! - 64 位整数最多 10 字节，32 位最多 5 字节，16 位 3 字节，8 位 2 字节。

use bytes::{Buf, BufMut};

use crate::error::{BufferError, Result};

/// 可按 ULEB128 编码的无符号整数。
///
/// 仅为原生无符号整型实现；`MAX_ENCODED_SIZE` 为该类型最大值编码后的字节数。
pub trait Uleb128Int: Copy + Default + Eq + core::fmt::Debug + sealed::Sealed {
    /// 该类型编码的最大字节数。
    const MAX_ENCODED_SIZE: usize;
    /// 该类型的最大值（以 `u64` 表示）。
    const MAX_AS_U64: u64;

    fn to_u64(self) -> u64;

    /// 调用方保证 `value <= MAX_AS_U64`。
    fn from_u64(value: u64) -> Self;
}

mod sealed {
    pub trait Sealed {}
}

macro_rules! impl_uleb128_int {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Uleb128Int for $ty {
                const MAX_ENCODED_SIZE: usize = (<$ty>::BITS as usize).div_ceil(7);
                const MAX_AS_U64: u64 = <$ty>::MAX as u64;

                #[inline]
                fn to_u64(self) -> u64 {
                    self as u64
                }

                #[inline]
                fn from_u64(value: u64) -> Self {
                    debug_assert!(value <= Self::MAX_AS_U64);
                    value as $ty
                }
            }
        )*
    };
}

impl_uleb128_int!(u8, u16, u32, u64, usize);

/// 返回类型 `T` 的最大编码字节数。
pub const fn max_encoded_size<T: Uleb128Int>() -> usize {
    T::MAX_ENCODED_SIZE
}

/// 编码 `value` 所需的最少字节数（`0..=127` 为 1 字节，每多 7 位加 1 字节）。
pub const fn encoded_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    if bits == 0 { 1 } else { bits.div_ceil(7) }
}

/// 将 `value` 写入 `out`，恰好写入 [`encoded_size`] 个字节。
///
/// `out` 的剩余空间不足时由 `BufMut` 实现决定行为（通常 panic），调用方应先预留。
pub fn write<B: BufMut + ?Sized>(value: u64, out: &mut B) {
    let mut rest = value;
    loop {
        let low = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest == 0 {
            out.put_u8(low);
            return;
        }
        out.put_u8(low | 0x80);
    }
}

/// 将 `value` 编码到定长栈缓冲中，返回缓冲与有效长度。
pub fn encode(value: u64) -> ([u8; 10], usize) {
    let mut scratch = [0u8; 10];
    let len = {
        let mut cursor: &mut [u8] = &mut scratch[..];
        write(value, &mut cursor);
        10 - cursor.len()
    };
    (scratch, len)
}

/// 从 `input` 解码一个 `T`，恰好消费编码时写入的字节数。
///
/// # 错误
/// - 输入耗尽：[`BufferError::Leb128Truncated`]；
/// - 字节数超过 `T::MAX_ENCODED_SIZE` 或数值超出 `T` 的表示范围：[`BufferError::Leb128Overflow`]。
pub fn read<T: Uleb128Int, B: Buf + ?Sized>(input: &mut B) -> Result<T> {
    let mut reader = Uleb128Reader::<T>::new();
    loop {
        if !input.has_remaining() {
            return Err(BufferError::Leb128Truncated);
        }
        let byte = input.get_u8();
        match reader.try_feed_byte(byte)? {
            true => return Ok(reader.value()),
            false => continue,
        }
    }
}

/// 逐字节增量解码器。
///
/// # 教案式说明
/// - **意图 (Why)**：块头可能被切分在两个分块末尾与开头，读取端无法一次拿到连续切片；
///   状态机允许在任意字节边界中断再续。
/// - **契约 (What)**：
///   - `feed_byte` 返回 `true` 表示本字节是最后一个字节，此后 [`value`](Self::value) 可用；
///   - 在完成前读取 `value`、或完成后继续喂入字节均为编程错误，直接 panic；
///   - [`reset`](Self::reset) 之后可复用同一实例解码下一个数值。
#[derive(Clone, Debug, Default)]
pub struct Uleb128Reader<T: Uleb128Int> {
    value: u64,
    shift: u32,
    bytes: usize,
    complete: bool,
    _marker: core::marker::PhantomData<T>,
}

impl<T: Uleb128Int> Uleb128Reader<T> {
    pub fn new() -> Self {
        Self {
            value: 0,
            shift: 0,
            bytes: 0,
            complete: false,
            _marker: core::marker::PhantomData,
        }
    }

    /// 喂入一个字节，返回解码是否在此字节完成。
    ///
    /// 超长或越界的编码视为调用方传入了损坏数据，直接 panic；需要可恢复路径时使用 [`read`]。
    pub fn feed_byte(&mut self, byte: u8) -> bool {
        match self.try_feed_byte(byte) {
            Ok(done) => done,
            Err(err) => panic!("Uleb128Reader::feed_byte: {err}"),
        }
    }

    fn try_feed_byte(&mut self, byte: u8) -> Result<bool> {
        assert!(
            !self.complete,
            "Uleb128Reader already complete, call reset() before feeding more bytes"
        );
        self.bytes += 1;
        if self.bytes > T::MAX_ENCODED_SIZE {
            return Err(BufferError::Leb128Overflow {
                max_bytes: T::MAX_ENCODED_SIZE,
            });
        }
        let payload = u64::from(byte & 0x7F);
        let shifted = payload << self.shift;
        if shifted >> self.shift != payload {
            return Err(BufferError::Leb128Overflow {
                max_bytes: T::MAX_ENCODED_SIZE,
            });
        }
        self.value |= shifted;
        if self.value > T::MAX_AS_U64 {
            return Err(BufferError::Leb128Overflow {
                max_bytes: T::MAX_ENCODED_SIZE,
            });
        }
        if byte & 0x80 == 0 {
            self.complete = true;
        } else {
            self.shift += 7;
        }
        Ok(self.complete)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// 已完成解码的数值。
    ///
    /// # Panics
    /// 解码尚未完成时调用。
    pub fn value(&self) -> T {
        assert!(self.complete, "Uleb128Reader::value() read before completion");
        T::from_u64(self.value)
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VECTORS: &[(u64, &[u8])] = &[
        (0, &[0x00]),
        (1, &[0x01]),
        (0x7F, &[0x7F]),
        (0x80, &[0x80, 0x01]),
        (0x81, &[0x81, 0x01]),
        (0xFF, &[0xFF, 0x01]),
        (0x100, &[0x80, 0x02]),
        (0xFFFF_FFFF, &[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
        (
            u64::MAX,
            &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01],
        ),
    ];

    #[test]
    fn max_sizes_match_integer_width() {
        assert_eq!(max_encoded_size::<u8>(), 2);
        assert_eq!(max_encoded_size::<u16>(), 3);
        assert_eq!(max_encoded_size::<u32>(), 5);
        assert_eq!(max_encoded_size::<u64>(), 10);
    }

    #[test]
    fn known_vectors_encode_and_decode() {
        for &(value, bytes) in VECTORS {
            assert_eq!(encoded_size(value), bytes.len(), "size of {value:#x}");
            let (scratch, len) = encode(value);
            assert_eq!(&scratch[..len], bytes, "bytes of {value:#x}");

            let mut input = bytes;
            let decoded: u64 = read(&mut input).expect("合法编码应能解码");
            assert_eq!(decoded, value);
            assert!(input.is_empty(), "应恰好消费全部字节");
        }
    }

    #[test]
    fn incremental_reader_completes_on_last_byte_and_resets() {
        for &(value, bytes) in VECTORS {
            let mut reader = Uleb128Reader::<u64>::new();
            for _round in 0..2 {
                assert!(!reader.is_complete());
                for (i, &b) in bytes.iter().enumerate() {
                    let done = reader.feed_byte(b);
                    assert_eq!(done, i + 1 == bytes.len());
                }
                assert!(reader.is_complete());
                assert_eq!(reader.value(), value);
                reader.reset();
            }
        }
    }

    #[test]
    #[should_panic(expected = "before completion")]
    fn value_before_completion_panics() {
        let mut reader = Uleb128Reader::<u32>::new();
        reader.feed_byte(0x80);
        let _ = reader.value();
    }

    #[test]
    fn truncated_and_oversized_inputs_are_rejected() {
        let mut truncated: &[u8] = &[0x80, 0x80];
        assert_eq!(
            read::<u64, _>(&mut truncated),
            Err(BufferError::Leb128Truncated)
        );

        let mut too_big_for_u8: &[u8] = &[0x80, 0x02];
        assert_eq!(
            read::<u8, _>(&mut too_big_for_u8),
            Err(BufferError::Leb128Overflow { max_bytes: 2 })
        );

        let mut eleven_bytes: &[u8] = &[0xFF; 11];
        assert!(matches!(
            read::<u64, _>(&mut eleven_bytes),
            Err(BufferError::Leb128Overflow { .. })
        ));
    }
}
