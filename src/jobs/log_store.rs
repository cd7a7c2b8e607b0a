//! 作业日志：有界、只追加、带游标的增量读取
//!
//! 超过容量时丢弃最旧的行（滑动窗口）；latest_seq 始终是分配过的最大序号，
//! 即使低序号条目已被淘汰，轮询方也能从上次游标无缝继续。

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 默认保留的日志行数
pub const DEFAULT_MAX_LOG_LINES: usize = 2000;

/// 日志来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// 引擎自身写入的提示（排队、终止、失败等）
    System,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单行日志，追加后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub text: String,
}

/// 单个作业的日志缓冲
#[derive(Debug)]
pub struct LogStore {
    max_lines: usize,
    entries: VecDeque<LogEntry>,
    latest_seq: u64,
}

impl LogStore {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            entries: VecDeque::new(),
            latest_seq: 0,
        }
    }

    /// 分配下一个序号并存储；超出容量时淘汰最旧条目
    pub fn append(&mut self, stream: LogStream, text: impl Into<String>) -> LogEntry {
        self.latest_seq += 1;
        let entry = LogEntry {
            seq: self.latest_seq,
            timestamp: Utc::now(),
            stream,
            text: text.into(),
        };
        self.entries.push_back(entry.clone());
        while self.entries.len() > self.max_lines {
            self.entries.pop_front();
        }
        entry
    }

    /// cursor <= 0 返回全部保留条目，否则只返回 seq > cursor 的条目
    pub fn collect(&self, cursor: i64) -> (Vec<LogEntry>, u64) {
        let items = if cursor <= 0 {
            self.entries.iter().cloned().collect()
        } else {
            let cursor = cursor as u64;
            // 条目按 seq 严格递增，可二分定位
            let start = self.entries.partition_point(|e| e.seq <= cursor);
            self.entries.iter().skip(start).cloned().collect()
        };
        (items, self.latest_seq)
    }

    pub fn latest_seq(&self) -> u64 {
        self.latest_seq
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LOG_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assigns_increasing_seq() {
        let mut store = LogStore::default();
        let a = store.append(LogStream::Stdout, "a");
        let b = store.append(LogStream::Stderr, "b");
        let c = store.append(LogStream::System, "c");
        assert_eq!((a.seq, b.seq, c.seq), (1, 2, 3));
        assert_eq!(store.latest_seq(), 3);
    }

    #[test]
    fn test_collect_with_cursor() {
        let mut store = LogStore::default();
        for i in 0..5 {
            store.append(LogStream::Stdout, format!("line {i}"));
        }

        let (all, latest) = store.collect(0);
        assert_eq!(all.len(), 5);
        assert_eq!(latest, 5);

        let (all, _) = store.collect(-3);
        assert_eq!(all.len(), 5);

        let (tail, latest) = store.collect(3);
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(latest, 5);

        let (none, latest) = store.collect(5);
        assert!(none.is_empty());
        assert_eq!(latest, 5);
    }

    #[test]
    fn test_sliding_window_keeps_latest_seq() {
        let mut store = LogStore::new(3);
        for i in 0..10 {
            store.append(LogStream::Stdout, format!("{i}"));
        }
        assert_eq!(store.len(), 3);

        let (entries, latest) = store.collect(0);
        assert_eq!(entries.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![8, 9, 10]);
        assert_eq!(latest, 10);

        // 游标落在已淘汰区间：只丢失被淘汰的部分
        let (entries, _) = store.collect(2);
        assert_eq!(entries.first().map(|e| e.seq), Some(8));
    }

    #[test]
    fn test_cursor_monotonicity() {
        let mut store = LogStore::new(4);
        let mut cursor = 0i64;
        let mut last_next = 0u64;
        for round in 0..6 {
            for i in 0..round {
                store.append(LogStream::Stdout, format!("{round}-{i}"));
            }
            let (entries, next) = store.collect(cursor);
            assert!(entries.iter().all(|e| cursor <= 0 || e.seq > cursor as u64));
            assert!(next >= last_next);
            last_next = next;
            cursor = next as i64;
        }
    }

    #[test]
    fn test_stream_serializes_lowercase() {
        let json = serde_json::to_value(LogStream::Stderr).unwrap();
        assert_eq!(json, serde_json::json!("stderr"));
    }
}
