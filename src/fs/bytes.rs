// ============================================================================
// src/fs/bytes.rs - Little-endian field access
// ============================================================================
//!
//! オンディスク / ワイヤ形式のフィールドを明示的なバイトオフセットで読み書きする。
//! packed構造体のキャストは使わない。範囲外アクセスは `InvalidArgument`
//! (データが短い = 形式が壊れている) として扱う。

use alloc::string::String;

use crate::error::{FsError, FsResult};

/// `data[offset..offset + len]` を範囲検査付きで取得
#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> FsResult<&[u8]> {
    let end = offset.checked_add(len).ok_or(FsError::InvalidArgument)?;
    data.get(offset..end).ok_or(FsError::InvalidArgument)
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> FsResult<&mut [u8]> {
    let end = offset.checked_add(len).ok_or(FsError::InvalidArgument)?;
    data.get_mut(offset..end).ok_or(FsError::InvalidArgument)
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> FsResult<u8> {
    data.get(offset).copied().ok_or(FsError::InvalidArgument)
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> FsResult<u16> {
    Ok(u16::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> FsResult<u32> {
    Ok(u32::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> FsResult<i32> {
    Ok(i32::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> FsResult<u64> {
    Ok(u64::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> FsResult<[u8; N]> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> FsResult<()> {
    write_bytes(data, offset, &[value])
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> FsResult<()> {
    write_bytes(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> FsResult<()> {
    write_bytes(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_i32(data: &mut [u8], offset: usize, value: i32) -> FsResult<()> {
    write_bytes(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> FsResult<()> {
    write_bytes(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, value: &[u8]) -> FsResult<()> {
    ensure_slice_mut(data, offset, value.len())?.copy_from_slice(value);
    Ok(())
}

/// NUL終端 (またはNULパディング) されたバイト列を文字列化
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_le() {
        let data = [0x34, 0x12, 0x78, 0x56, 0xAA, 0xBB, 0xCC, 0xDD, 0x01];
        assert_eq!(read_le_u16(&data, 0).unwrap(), 0x1234);
        assert_eq!(read_le_u32(&data, 0).unwrap(), 0x5678_1234);
        assert_eq!(read_le_u64(&data, 1).unwrap(), 0x01DD_CCBB_AA56_7812);
        assert_eq!(read_u8(&data, 8).unwrap(), 0x01);
    }

    #[test]
    fn test_out_of_bounds_is_invalid_argument() {
        let data = [0u8; 4];
        assert_eq!(read_le_u32(&data, 1), Err(FsError::InvalidArgument));
        assert_eq!(read_le_u16(&data, usize::MAX), Err(FsError::InvalidArgument));
        assert_eq!(read_u8(&data, 4), Err(FsError::InvalidArgument));
    }

    #[test]
    fn test_write_then_read() {
        let mut data = [0u8; 8];
        write_le_u32(&mut data, 2, 0xDEAD_BEEF).unwrap();
        assert_eq!(data[2..6], [0xEF, 0xBE, 0xAD, 0xDE]);
        assert!(write_le_u64(&mut data, 1, 0).is_err());
    }

    #[test]
    fn test_trim_nul_padded() {
        assert_eq!(trim_nul_padded(b"lost+found\0\0"), "lost+found");
        assert_eq!(trim_nul_padded(b"abc"), "abc");
    }
}
