//! # Feed (追加日志文件)
//!
//! 存储底层的单个追加日志。一个文件 = 一个日志：
//!
//! ```text
//! {"format":2,"signer":{"publicKey":"..","secretKey":".."},"keyCheck":"..","createdAt":".."}
//! {"seq":0,"data":"<base64(nonce ‖ AES-GCM({key, value}))>","sig":"<hex>"}
//! {"seq":1,"data":"..","sig":".."}
//! ```
//!
//! ## 格式版本
//!
//! - `Legacy` (format 1)：无 keyCheck，块不签名
//! - `Current` (format 2)：头部带 keyCheck（内容密钥错误时 `ready` 失败），
//!   每个块用签名密钥对签名 `seq_be ‖ sealed`
//!
//! 日志文件不支持原地覆写：`Feed::create` 在目标已存在时直接失败。

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{ContentKey, CryptoError, FeedKeyPair};

/// 主日志中标记子集合的字段
pub const SUB_LABEL: &str = "__sub";
/// 记录操作类型字段；值为 [`DELETE_OP`] 表示删除该键
pub const OP_LABEL: &str = "__op";
pub const DELETE_OP: &str = "del";

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("feed already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("invalid feed header in {path}: {reason}")]
    Header { path: PathBuf, reason: String },

    #[error("feed {path} has format {actual}, expected {expected}")]
    FormatMismatch {
        path: PathBuf,
        expected: u8,
        actual: u8,
    },

    #[error("feed {path} rejected the content key")]
    WrongKey { path: PathBuf },

    #[error("feed {path} signer keypair is inconsistent")]
    InconsistentSigner { path: PathBuf },

    #[error("malformed block at line {line} of {path}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("bad signature on block {seq} of {path}")]
    BadSignature { path: PathBuf, seq: u64 },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl FeedError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        FeedError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type FeedResult<T> = std::result::Result<T, FeedError>;

/// 日志文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedFormat {
    Legacy,
    Current,
}

impl FeedFormat {
    pub fn version(&self) -> u8 {
        match self {
            FeedFormat::Legacy => 1,
            FeedFormat::Current => 2,
        }
    }

    pub fn from_version(version: u8) -> Option<Self> {
        match version {
            1 => Some(FeedFormat::Legacy),
            2 => Some(FeedFormat::Current),
            _ => None,
        }
    }

    fn signs_blocks(&self) -> bool {
        matches!(self, FeedFormat::Current)
    }
}

/// 日志记录：键、值与单调递增的序号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub seq: u64,
    pub key: String,
    pub value: Value,
}

impl LogRecord {
    /// 记录值中嵌入的子集合标签；无标签表示内部事务
    pub fn subcollection(&self) -> Option<&str> {
        self.value.get(SUB_LABEL).and_then(Value::as_str)
    }

    /// 删除事务：该键此后不再存活
    pub fn is_delete(&self) -> bool {
        self.value.get(OP_LABEL).and_then(Value::as_str) == Some(DELETE_OP)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedHeader {
    format: u8,
    signer: FeedKeyPair,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_check: Option<String>,
    #[serde(default)]
    created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlockLine {
    seq: u64,
    data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sig: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct BlockPayload {
    key: String,
    value: Value,
}

fn signing_message(seq: u64, sealed: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(8 + sealed.len());
    message.extend_from_slice(&seq.to_be_bytes());
    message.extend_from_slice(sealed);
    message
}

/// 已打开的日志
pub struct Feed {
    path: PathBuf,
    format: FeedFormat,
    header: FeedHeader,
    key: ContentKey,
    length: u64,
    writer: Option<BufWriter<File>>,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("length", &self.length)
            .finish()
    }
}

impl Feed {
    /// 以给定签名密钥对创建新日志；目标已存在时失败
    pub fn create(
        path: &Path,
        format: FeedFormat,
        signer: &FeedKeyPair,
        key: &ContentKey,
    ) -> FeedResult<Self> {
        if path.exists() {
            return Err(FeedError::AlreadyExists(path.to_path_buf()));
        }

        let key_check = match format {
            FeedFormat::Current => Some(general_purpose::STANDARD.encode(key.seal(signer.public_key())?)),
            FeedFormat::Legacy => None,
        };
        let header = FeedHeader {
            format: format.version(),
            signer: signer.clone(),
            key_check,
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| FeedError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        let line = serde_json::to_string(&header).map_err(|e| FeedError::Header {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        writeln!(writer, "{}", line).map_err(|e| FeedError::io(path, e))?;
        writer.flush().map_err(|e| FeedError::io(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            format,
            header,
            key: key.clone(),
            length: 0,
            writer: Some(writer),
        })
    }

    /// 打开已有日志，要求头部格式与 `format` 一致
    pub fn open(path: &Path, format: FeedFormat, key: &ContentKey) -> FeedResult<Self> {
        let file = File::open(path).map_err(|e| FeedError::io(path, e))?;
        let mut lines = BufReader::new(file).lines();
        let header = read_header(path, &mut lines)?;

        if header.format != format.version() {
            return Err(FeedError::FormatMismatch {
                path: path.to_path_buf(),
                expected: format.version(),
                actual: header.format,
            });
        }

        let mut length = 0u64;
        for line in lines {
            let line = line.map_err(|e| FeedError::io(path, e))?;
            if !line.trim().is_empty() {
                length += 1;
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            format,
            header,
            key: key.clone(),
            length,
            writer: None,
        })
    }

    /// 等待日志就绪：校验签名密钥对一致性与内容密钥
    pub fn ready(&self) -> FeedResult<()> {
        if !self.header.signer.is_consistent() {
            return Err(FeedError::InconsistentSigner {
                path: self.path.clone(),
            });
        }

        if let Some(check) = &self.header.key_check {
            let sealed = general_purpose::STANDARD
                .decode(check)
                .map_err(|e| FeedError::Header {
                    path: self.path.clone(),
                    reason: format!("keyCheck base64: {}", e),
                })?;
            match self.key.open(&sealed) {
                Ok(plain) if plain.as_slice() == self.header.signer.public_key().as_slice() => {}
                _ => {
                    return Err(FeedError::WrongKey {
                        path: self.path.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> FeedFormat {
        self.format
    }

    /// 日志头中的签名密钥对（日志的持久身份）
    pub fn signer(&self) -> &FeedKeyPair {
        &self.header.signer
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// 追加一条记录，返回其序号
    pub fn append(&mut self, key: &str, value: &Value) -> FeedResult<u64> {
        let seq = self.length;
        let payload = serde_json::to_vec(&BlockPayload {
            key: key.to_string(),
            value: value.clone(),
        })
        .map_err(|e| FeedError::Malformed {
            path: self.path.clone(),
            line: seq as usize + 2,
            reason: e.to_string(),
        })?;
        let sealed = self.key.seal(&payload)?;
        let sig = self
            .format
            .signs_blocks()
            .then(|| hex::encode(self.header.signer.sign(&signing_message(seq, &sealed))));

        let line = serde_json::to_string(&BlockLine {
            seq,
            data: general_purpose::STANDARD.encode(&sealed),
            sig,
        })
        .map_err(|e| FeedError::Malformed {
            path: self.path.clone(),
            line: seq as usize + 2,
            reason: e.to_string(),
        })?;

        let path = self.path.clone();
        let writer = match self.writer.take() {
            Some(w) => w,
            None => {
                let file = OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .map_err(|e| FeedError::io(&path, e))?;
                BufWriter::new(file)
            }
        };
        let writer = self.writer.insert(writer);
        writeln!(writer, "{}", line).map_err(|e| FeedError::io(&path, e))?;
        writer.flush().map_err(|e| FeedError::io(&path, e))?;

        self.length += 1;
        Ok(seq)
    }

    /// 从头读取所有记录（惰性迭代，独立的文件句柄）
    pub fn records(&self) -> FeedResult<FeedRecords> {
        let file = File::open(&self.path).map_err(|e| FeedError::io(&self.path, e))?;
        let mut lines = BufReader::new(file).lines();
        // 跳过头部
        read_header(&self.path, &mut lines)?;
        Ok(FeedRecords {
            path: self.path.clone(),
            lines,
            line_no: 1,
            key: self.key.clone(),
            verify_with: self
                .format
                .signs_blocks()
                .then(|| self.header.signer.clone()),
        })
    }

    /// 关闭日志：刷盘后释放句柄
    pub fn close(mut self) -> FeedResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| FeedError::io(&self.path, e))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| FeedError::io(&self.path, e))?;
        }
        Ok(())
    }
}

/// 只读取日志头中的格式版本（用于识别存储版本）
pub fn read_format_version(path: &Path) -> FeedResult<u8> {
    let file = File::open(path).map_err(|e| FeedError::io(path, e))?;
    let mut lines = BufReader::new(file).lines();
    Ok(read_header(path, &mut lines)?.format)
}

fn read_header(path: &Path, lines: &mut Lines<BufReader<File>>) -> FeedResult<FeedHeader> {
    let first = lines
        .next()
        .ok_or_else(|| FeedError::Header {
            path: path.to_path_buf(),
            reason: "empty file".to_string(),
        })?
        .map_err(|e| FeedError::io(path, e))?;
    serde_json::from_str(&first).map_err(|e| FeedError::Header {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// 日志记录迭代器；任一块解析失败即返回错误
pub struct FeedRecords {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
    key: ContentKey,
    verify_with: Option<FeedKeyPair>,
}

impl FeedRecords {
    fn malformed(&self, reason: impl Into<String>) -> FeedError {
        FeedError::Malformed {
            path: self.path.clone(),
            line: self.line_no,
            reason: reason.into(),
        }
    }

    fn decode(&self, line: &str) -> FeedResult<LogRecord> {
        let block: BlockLine =
            serde_json::from_str(line).map_err(|e| self.malformed(e.to_string()))?;
        let sealed = general_purpose::STANDARD
            .decode(&block.data)
            .map_err(|e| self.malformed(format!("base64: {}", e)))?;

        if let Some(signer) = &self.verify_with {
            let sig = block
                .sig
                .as_deref()
                .map(hex::decode)
                .transpose()
                .map_err(|e| self.malformed(format!("sig hex: {}", e)))?
                .ok_or_else(|| self.malformed("missing block signature"))?;
            signer
                .verify(&signing_message(block.seq, &sealed), &sig)
                .map_err(|_| FeedError::BadSignature {
                    path: self.path.clone(),
                    seq: block.seq,
                })?;
        }

        let plain = self.key.open(&sealed)?;
        let payload: BlockPayload =
            serde_json::from_slice(&plain).map_err(|e| self.malformed(e.to_string()))?;
        Ok(LogRecord {
            seq: block.seq,
            key: payload.key,
            value: payload.value,
        })
    }
}

impl Iterator for FeedRecords {
    type Item = FeedResult<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(FeedError::io(&self.path, e))),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(self.decode(&line));
        }
    }
}
