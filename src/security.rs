//! 请求签名
//!
//! policy 以键排序后的 JSON 编码为 urlsafe base64，
//! signature 为 HMAC-SHA256(secret, policy_b64) 的十六进制摘要

use crate::api::SecurityFields;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::ser::Formatter;
use sha2::Sha256;
use std::io;

type HmacSha256 = Hmac<Sha256>;

/// 签名策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Security {
    /// base64 编码后的策略
    pub policy_b64: String,
    /// 十六进制签名
    pub signature: String,
}

impl Security {
    /// 用应用密钥为策略签名
    pub fn new(policy: &serde_json::Value, secret: &str) -> Self {
        let policy_b64 = URL_SAFE.encode(policy_json(policy));
        let signature = hmac_sha256_hex(secret.as_bytes(), policy_b64.as_bytes());
        Self {
            policy_b64,
            signature,
        }
    }

    /// 使用已签好的 policy/signature
    pub fn from_parts(policy_b64: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            policy_b64: policy_b64.into(),
            signature: signature.into(),
        }
    }

    /// 签名 URL 片段：`security=p:<policy>,s:<signature>`
    pub fn as_url_string(&self) -> String {
        format!("security=p:{},s:{}", self.policy_b64, self.signature)
    }

    /// 附加到请求体中的字段
    pub fn fields(&self) -> SecurityFields {
        SecurityFields {
            policy: self.policy_b64.clone(),
            signature: self.signature.clone(),
        }
    }
}

/// 与服务端文档示例一致的 JSON 格式：分隔符为 `", "` 与 `": "`，
/// 非 ASCII 字符转义为 `\uXXXX`
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn write_string_fragment<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        if fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }

        let mut units = [0u16; 2];
        for c in fragment.chars() {
            if c.is_ascii() {
                writer.write_all(&[c as u8])?;
            } else {
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }

    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}

/// 序列化策略（serde_json 的 Map 按键排序）
fn policy_json(policy: &serde_json::Value) -> Vec<u8> {
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter);
    // 写入 Vec 不会产生 IO 错误，Value 的序列化也不会失败
    if policy.serialize(&mut serializer).is_err() {
        out.clear();
    }
    out
}

fn hmac_sha256_hex(key: &[u8], message: &[u8]) -> String {
    // HMAC 接受任意长度的密钥
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}
