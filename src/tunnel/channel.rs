// 通道握手编解码
//
// 隧道腿建立后交换的第一条消息：一段看似随机的字母数字文本，
// 偏移 1 处 4 位十六进制为总长度 N，偏移 5 处 8 位十六进制为 id ^ (N<<16 | N)，
// 所有十六进制字符大小写随机。整段作为一条传输消息发送。

use crate::config::MIN_ALIGNMENT;
use crate::error::{Result, TunnelError};
use crate::transmission::{FrameWriter, Transmission};
use rand::distr::Alphanumeric;
use rand::Rng;
use std::fmt;

/// 反转位
pub const INVERSION_FLAG: u32 = 0x8000_0000;

/// 通道号有效位
pub const MAGNITUDE_MASK: u32 = 0x7FFF_FFFF;

/// 握手头的长度上限
pub const MAX_HEADER_LEN: usize = 4096;

const LEN_OFFSET: usize = 1;
const ID_OFFSET: usize = LEN_OFFSET + 4;
const FIELDS_END: usize = ID_OFFSET + 8;

/// 通道号：bit 31 为反转位，bit 0..30 为非零序号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u32);

impl ChannelId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// 去掉反转位后的序号
    pub const fn magnitude(self) -> u32 {
        self.0 & MAGNITUDE_MASK
    }

    /// 是否设置了反转位
    pub const fn is_inverted(self) -> bool {
        self.0 & INVERSION_FLAG != 0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl From<ChannelId> for u32 {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

fn length_mask(n: usize) -> u32 {
    let n = n as u32;
    (n << 16) | n
}

/// 按给定总长度编码；`len` 必须在 14..=65535
pub fn encode_with_len(id: ChannelId, len: usize) -> Result<Vec<u8>> {
    if len <= FIELDS_END || len > u16::MAX as usize {
        return Err(TunnelError::protocol(format!(
            "channel header length {} out of range",
            len
        )));
    }

    let mut rng = rand::rng();
    let mut blob: Vec<u8> = (0..len).map(|_| rng.sample(Alphanumeric)).collect();

    let fields = format!("{:04X}{:08X}", len, id.raw() ^ length_mask(len));
    for (slot, ch) in blob[LEN_OFFSET..FIELDS_END].iter_mut().zip(fields.bytes()) {
        *slot = if ch.is_ascii_alphabetic() && rng.random_bool(0.5) {
            ch.to_ascii_lowercase()
        } else {
            ch
        };
    }

    Ok(blob)
}

/// 编码通道号，总长度在 [510, min(alignment, 4096)] 内随机
pub fn encode(id: ChannelId, alignment: usize) -> Result<Vec<u8>> {
    let min = MIN_ALIGNMENT;
    let max = alignment.min(MAX_HEADER_LEN).max(min);
    let len = rand::rng().random_range(min..=max);
    encode_with_len(id, len)
}

fn parse_hex(digits: &[u8]) -> Result<u32> {
    digits.iter().try_fold(0u32, |acc, &ch| {
        let value = (ch as char)
            .to_digit(16)
            .ok_or_else(|| TunnelError::protocol("channel header contains a non-hex digit"))?;
        Ok((acc << 4) | value)
    })
}

/// 解码通道号；长度、十六进制或序号非法时返回协议错误
pub fn decode(blob: &[u8]) -> Result<ChannelId> {
    if blob.len() < FIELDS_END {
        return Err(TunnelError::protocol(format!(
            "channel header too short ({} bytes)",
            blob.len()
        )));
    }

    let len = parse_hex(&blob[LEN_OFFSET..ID_OFFSET])? as usize;
    if len <= FIELDS_END {
        return Err(TunnelError::protocol(format!(
            "channel header declares invalid length {}",
            len
        )));
    }

    let id = ChannelId(parse_hex(&blob[ID_OFFSET..FIELDS_END])? ^ length_mask(len));

    if blob.len() != len {
        return Err(TunnelError::protocol(format!(
            "channel header length mismatch: declared {}, received {}",
            len,
            blob.len()
        )));
    }
    if id.magnitude() == 0 {
        return Err(TunnelError::protocol("channel id must not be zero"));
    }

    Ok(id)
}

/// 写出通道号（知道 id 的一方）
pub async fn write_channel_id(writer: &FrameWriter, id: ChannelId) -> Result<()> {
    let blob = encode(id, writer.max_segment_size())?;
    writer.write_frame(&blob).await
}

/// 读取通道号（等待学习 id 的一方）
pub async fn read_channel_id(transmission: &mut Transmission) -> Result<ChannelId> {
    let blob = transmission.read_frame().await?;
    decode(blob)
}
