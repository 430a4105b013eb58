//! 请求审计记录
//!
//! 固定容量的环形缓冲，写满后新记录覆盖最旧的记录。

use std::fmt;

/// 请求种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestKind {
    #[default]
    Flash,
    TxtPublic,
    Physical,
    Msr,
    Pci,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Flash => "flash",
            RequestKind::TxtPublic => "txt_public",
            RequestKind::Physical => "physical",
            RequestKind::Msr => "msr",
            RequestKind::Pci => "pci",
        };
        f.write_str(name)
    }
}

/// 一条审计记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuditEntry {
    pub kind: RequestKind,
    /// 成功时为 0，否则为状态码
    pub status: u32,
    pub transferred: usize,
}

impl AuditEntry {
    pub fn succeeded(&self) -> bool {
        self.status == 0
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    buf: Vec<AuditEntry>,
    read: usize,
    write: usize,
    full: bool,
}

impl AuditLog {
    /// 容量为 0 时不记录任何内容
    pub fn new(size: usize) -> Self {
        AuditLog {
            buf: vec![AuditEntry::default(); size],
            read: 0,
            write: 0,
            full: false,
        }
    }

    pub fn record(&mut self, entry: AuditEntry) {
        if self.buf.is_empty() {
            return;
        }
        self.buf[self.write] = entry;
        self.write = (self.write + 1) % self.buf.len();
        if self.full {
            self.read = self.write;
        } else if self.write == self.read {
            self.full = true;
        }
    }

    /// 取出全部记录，从旧到新
    pub fn drain(&mut self) -> Vec<AuditEntry> {
        let mut out = Vec::with_capacity(self.len());
        while !self.is_empty() {
            out.push(self.buf[self.read]);
            self.read = (self.read + 1) % self.buf.len();
            self.full = false;
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.read == self.write
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        if self.full {
            self.buf.len()
        } else if self.buf.is_empty() {
            0
        } else {
            (self.write + self.buf.len() - self.read) % self.buf.len()
        }
    }
}
