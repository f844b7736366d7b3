use bytes::{Buf, BufMut};

use crate::entry::{EntryReader, EntryWriter};
use crate::error::{BufferError, Result};
use crate::leb128;

/// 可写入块负载的类型。
///
/// `serialized_bytes` 必须与 `serialize` 实际写入的字节数一致，缓冲据此预留空间。
pub trait Serialize {
    fn serialized_bytes(&self) -> usize;

    fn serialize(&self, writer: &mut EntryWriter<'_>);
}

/// 可从块负载读出的类型。
///
/// 内容不合法（例如非 UTF-8 字符串）或在块末尾被截断时返回错误，不会越界读取。
pub trait Deserialize: Sized {
    fn deserialize(reader: &mut EntryReader<'_>) -> Result<Self>;
}

impl<T: Serialize + ?Sized> Serialize for &T {
    fn serialized_bytes(&self) -> usize {
        (**self).serialized_bytes()
    }

    fn serialize(&self, writer: &mut EntryWriter<'_>) {
        (**self).serialize(writer);
    }
}

macro_rules! impl_fixed_width {
    ($($ty:ty => $put:ident, $get:ident);* $(;)?) => {
        $(
            impl Serialize for $ty {
                fn serialized_bytes(&self) -> usize {
                    core::mem::size_of::<$ty>()
                }

                fn serialize(&self, writer: &mut EntryWriter<'_>) {
                    writer.$put(*self);
                }
            }

            impl Deserialize for $ty {
                fn deserialize(reader: &mut EntryReader<'_>) -> Result<Self> {
                    ensure_remaining(reader, core::mem::size_of::<$ty>(), stringify!($ty))?;
                    Ok(reader.$get())
                }
            }
        )*
    };
}

impl_fixed_width! {
    u8 => put_u8, get_u8;
    i8 => put_i8, get_i8;
    u16 => put_u16_le, get_u16_le;
    i16 => put_i16_le, get_i16_le;
    u32 => put_u32_le, get_u32_le;
    i32 => put_i32_le, get_i32_le;
    u64 => put_u64_le, get_u64_le;
    i64 => put_i64_le, get_i64_le;
    f32 => put_f32_le, get_f32_le;
    f64 => put_f64_le, get_f64_le;
}

impl Serialize for bool {
    fn serialized_bytes(&self) -> usize {
        1
    }

    fn serialize(&self, writer: &mut EntryWriter<'_>) {
        writer.put_u8(u8::from(*self));
    }
}

impl Deserialize for bool {
    fn deserialize(reader: &mut EntryReader<'_>) -> Result<Self> {
        ensure_remaining(reader, 1, "bool")?;
        match reader.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(BufferError::InvalidPayload {
                type_name: "bool",
                reason: "tag byte is neither 0 nor 1",
            }),
        }
    }
}

impl Serialize for char {
    fn serialized_bytes(&self) -> usize {
        4
    }

    fn serialize(&self, writer: &mut EntryWriter<'_>) {
        writer.put_u32_le(u32::from(*self));
    }
}

impl Deserialize for char {
    fn deserialize(reader: &mut EntryReader<'_>) -> Result<Self> {
        ensure_remaining(reader, 4, "char")?;
        char::from_u32(reader.get_u32_le()).ok_or(BufferError::InvalidPayload {
            type_name: "char",
            reason: "not a Unicode scalar value",
        })
    }
}

impl Serialize for str {
    fn serialized_bytes(&self) -> usize {
        leb128::encoded_size(self.len() as u64) + self.len()
    }

    fn serialize(&self, writer: &mut EntryWriter<'_>) {
        writer.write_uleb128(self.len() as u64);
        writer.write_bytes(self.as_bytes());
    }
}

impl Serialize for String {
    fn serialized_bytes(&self) -> usize {
        self.as_str().serialized_bytes()
    }

    fn serialize(&self, writer: &mut EntryWriter<'_>) {
        self.as_str().serialize(writer);
    }
}

impl Deserialize for String {
    fn deserialize(reader: &mut EntryReader<'_>) -> Result<Self> {
        let len = read_length(reader, "String")?;
        let mut bytes = vec![0u8; len];
        reader.read_bytes(&mut bytes);
        String::from_utf8(bytes).map_err(|_| BufferError::InvalidPayload {
            type_name: "String",
            reason: "invalid UTF-8",
        })
    }
}

impl<T: Serialize> Serialize for [T] {
    fn serialized_bytes(&self) -> usize {
        leb128::encoded_size(self.len() as u64)
            + self.iter().map(Serialize::serialized_bytes).sum::<usize>()
    }

    fn serialize(&self, writer: &mut EntryWriter<'_>) {
        writer.write_uleb128(self.len() as u64);
        for item in self {
            item.serialize(writer);
        }
    }
}

impl<T: Serialize> Serialize for Vec<T> {
    fn serialized_bytes(&self) -> usize {
        self.as_slice().serialized_bytes()
    }

    fn serialize(&self, writer: &mut EntryWriter<'_>) {
        self.as_slice().serialize(writer);
    }
}

impl<T: Deserialize> Deserialize for Vec<T> {
    fn deserialize(reader: &mut EntryReader<'_>) -> Result<Self> {
        let len = read_length(reader, "Vec")?;
        (0..len).map(|_| T::deserialize(reader)).collect()
    }
}

impl<T: Serialize> Serialize for Option<T> {
    fn serialized_bytes(&self) -> usize {
        1 + self.as_ref().map_or(0, Serialize::serialized_bytes)
    }

    fn serialize(&self, writer: &mut EntryWriter<'_>) {
        match self {
            None => writer.put_u8(0),
            Some(value) => {
                writer.put_u8(1);
                value.serialize(writer);
            }
        }
    }
}

impl<T: Deserialize> Deserialize for Option<T> {
    fn deserialize(reader: &mut EntryReader<'_>) -> Result<Self> {
        ensure_remaining(reader, 1, "Option")?;
        match reader.get_u8() {
            0 => Ok(None),
            1 => T::deserialize(reader).map(Some),
            _ => Err(BufferError::InvalidPayload {
                type_name: "Option",
                reason: "tag byte is neither 0 nor 1",
            }),
        }
    }
}

fn ensure_remaining(reader: &EntryReader<'_>, bytes: usize, type_name: &'static str) -> Result<()> {
    if reader.remaining_bytes() < bytes {
        return Err(BufferError::InvalidPayload {
            type_name,
            reason: "truncated at the end of the block",
        });
    }
    Ok(())
}

/// 读取元素个数；每个元素至少占 1 字节，超过剩余字节数的长度视为损坏。
fn read_length(reader: &mut EntryReader<'_>, type_name: &'static str) -> Result<usize> {
    let len = usize::try_from(reader.read_uleb128()?).map_err(|_| BufferError::InvalidPayload {
        type_name,
        reason: "length does not fit in usize",
    })?;
    if len > reader.remaining_bytes() {
        return Err(BufferError::InvalidPayload {
            type_name,
            reason: "length exceeds the rest of the block",
        });
    }
    Ok(len)
}

macro_rules! impl_tuple {
    ($($name:ident),+) => {
        impl<$($name: Serialize),+> Serialize for ($($name,)+) {
            fn serialized_bytes(&self) -> usize {
                #[allow(non_snake_case)]
                let ($($name,)+) = self;
                0 $(+ $name.serialized_bytes())+
            }

            fn serialize(&self, writer: &mut EntryWriter<'_>) {
                #[allow(non_snake_case)]
                let ($($name,)+) = self;
                $($name.serialize(writer);)+
            }
        }

        impl<$($name: Deserialize),+> Deserialize for ($($name,)+) {
            fn deserialize(reader: &mut EntryReader<'_>) -> Result<Self> {
                Ok(($($name::deserialize(reader)?,)+))
            }
        }
    };
}

impl_tuple!(A);
impl_tuple!(A, B);
impl_tuple!(A, B, C);
impl_tuple!(A, B, C, D);
