// ==========================================
// 供应商目录导入系统 - 分块流读取
// ==========================================
// 职责: 流式读取分隔文本，按块交付，消费端拉取一次才解析下一块
// 技术: csv::ReaderBuilder(flexible) + spawn_blocking 解析线程
//       需求通道(容量1) + 数据通道(容量1) 形成背压
// ==========================================

use crate::config::StreamConfig;
use crate::importer::error::{ImportError, ImportResult};
use csv::{ByteRecord, ReaderBuilder};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 自动检测的候选分隔符
const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

const UTF8_BOM: char = '\u{feff}';

// ==========================================
// 数据结构
// ==========================================

/// 原始数据行（row_number 从 1 开始，不含表头）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub row_number: u64,
    pub fields: Vec<String>,
}

/// 一个分块
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: u64,
    pub rows: Vec<RawRow>,
    pub malformed: u64,  // 无法解码而被跳过的行
    pub bytes_read: u64, // 该块结束时的文件字节偏移
    pub first_row: u64,
    pub last_row: u64,
}

impl Chunk {
    /// 本块消耗的数据行（含 malformed）
    pub fn rows_consumed(&self) -> u64 {
        self.rows.len() as u64 + self.malformed
    }
}

// ==========================================
// 分隔符检测
// ==========================================

/// 从表头行检测分隔符（引号外出现次数最多者，平局按候选顺序，默认逗号）
pub fn detect_delimiter(header_line: &[u8]) -> u8 {
    let mut counts = [0usize; CANDIDATE_DELIMITERS.len()];
    let mut in_quotes = false;

    for &b in header_line {
        if b == b'"' {
            in_quotes = !in_quotes;
            continue;
        }
        if in_quotes {
            continue;
        }
        if let Some(pos) = CANDIDATE_DELIMITERS.iter().position(|d| *d == b) {
            counts[pos] += 1;
        }
    }

    let mut best = 0;
    for (i, count) in counts.iter().enumerate() {
        if *count > counts[best] {
            best = i;
        }
    }
    if counts[best] == 0 {
        b','
    } else {
        CANDIDATE_DELIMITERS[best]
    }
}

// ==========================================
// 进度估算
// ==========================================

/// 按已读字节换算进度（5..=95，两端留给开始与终结）
pub fn progress_for_bytes(bytes_read: u64, file_len: u64) -> u8 {
    if file_len == 0 {
        return 95;
    }
    let ratio = (bytes_read.min(file_len) as f64) / (file_len as f64);
    (5.0 + 90.0 * ratio).floor().clamp(5.0, 95.0) as u8
}

/// 按已读字节外推总行数
pub fn estimate_total_rows(rows_seen: u64, bytes_read: u64, file_len: u64) -> Option<u64> {
    if rows_seen == 0 || bytes_read == 0 {
        return None;
    }
    let estimate = (rows_seen as f64) * (file_len as f64) / (bytes_read as f64);
    Some(estimate.round().max(rows_seen as f64) as u64)
}

// ==========================================
// ChunkStream
// ==========================================
pub struct ChunkStream {
    headers: Vec<String>,
    delimiter: u8,
    file_len: u64,
    demand_tx: Option<mpsc::Sender<()>>,
    data_rx: mpsc::Receiver<ImportResult<Chunk>>,
    producer: Option<JoinHandle<()>>,
    finished: bool,
}

impl ChunkStream {
    /// 打开文件并读取表头
    ///
    /// # 返回
    /// - Err(FileNotFound / FileReadError): 文件不可读
    /// - Err(HeaderParseError): 表头缺失或无法解析
    pub async fn open(path: impl AsRef<Path>, config: &StreamConfig) -> ImportResult<Self> {
        let path = path.as_ref().to_path_buf();
        let chunk_size = config.chunk_size.max(1);
        let configured = config.delimiter;

        let opened = tokio::task::spawn_blocking(move || open_reader(&path, configured)).await??;
        let OpenedFile {
            reader,
            headers,
            delimiter,
            file_len,
        } = opened;

        debug!(
            columns = headers.len(),
            delimiter = %(delimiter as char).escape_default(),
            file_len,
            chunk_size,
            "文件已打开"
        );

        let (demand_tx, demand_rx) = mpsc::channel::<()>(1);
        let (data_tx, data_rx) = mpsc::channel::<ImportResult<Chunk>>(1);
        let producer =
            tokio::task::spawn_blocking(move || produce(reader, chunk_size, demand_rx, data_tx));

        Ok(Self {
            headers,
            delimiter,
            file_len,
            demand_tx: Some(demand_tx),
            data_rx,
            producer: Some(producer),
            finished: false,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// 拉取下一块
    ///
    /// # 返回
    /// - Ok(Some(chunk)): 下一块
    /// - Ok(None): 文件结束
    /// - Err: 流读取错误（致命）
    pub async fn next_chunk(&mut self) -> ImportResult<Option<Chunk>> {
        if self.finished {
            return Ok(None);
        }
        if let Some(demand) = self.demand_tx.as_ref() {
            // 解析线程已退出时发送失败，随后 recv 会返回剩余数据或 None
            let _ = demand.send(()).await;
        }

        match self.data_rx.recv().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => {
                self.finished = true;
                Err(e)
            }
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    /// 关闭流并等待解析线程退出
    pub async fn close(mut self) -> ImportResult<()> {
        self.demand_tx.take();
        self.data_rx.close();
        if let Some(handle) = self.producer.take() {
            handle.await?;
        }
        Ok(())
    }
}

struct OpenedFile {
    reader: csv::Reader<File>,
    headers: Vec<String>,
    delimiter: u8,
    file_len: u64,
}

fn open_reader(path: &Path, configured: Option<u8>) -> ImportResult<OpenedFile> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ImportError::FileNotFound(path.display().to_string())
        } else {
            ImportError::FileReadError(format!("{}: {}", path.display(), e))
        }
    })?;
    if !metadata.is_file() {
        return Err(ImportError::FileReadError(format!(
            "不是普通文件: {}",
            path.display()
        )));
    }

    let mut file = File::open(path)?;
    let delimiter = match configured {
        Some(d) => d,
        None => {
            let mut first_line = Vec::new();
            BufReader::new(&mut file).read_until(b'\n', &mut first_line)?;
            detect_delimiter(&first_line)
        }
    };
    file.seek(SeekFrom::Start(0))?;

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true) // 允许行长度不一致
        .delimiter(delimiter)
        .from_reader(file);

    let raw_headers = reader
        .byte_headers()
        .map_err(|e| ImportError::HeaderParseError(e.to_string()))?
        .clone();

    let headers: Vec<String> = raw_headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let text = String::from_utf8_lossy(h);
            let text = if i == 0 {
                text.trim_start_matches(UTF8_BOM).to_string()
            } else {
                text.into_owned()
            };
            text.trim().to_string()
        })
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(ImportError::HeaderParseError("表头为空".to_string()));
    }

    Ok(OpenedFile {
        reader,
        headers,
        delimiter,
        file_len: metadata.len(),
    })
}

fn decode_record(record: &ByteRecord) -> Option<Vec<String>> {
    record
        .iter()
        .map(|field| std::str::from_utf8(field).map(str::to_string))
        .collect::<Result<Vec<_>, _>>()
        .ok()
}

/// 解析线程：每收到一次需求只读一块
fn produce(
    mut reader: csv::Reader<File>,
    chunk_size: usize,
    mut demand_rx: mpsc::Receiver<()>,
    data_tx: mpsc::Sender<ImportResult<Chunk>>,
) {
    let mut record = ByteRecord::new();
    let mut index = 0u64;
    let mut row_number = 0u64;
    let mut eof = false;

    while !eof {
        if demand_rx.blocking_recv().is_none() {
            debug!(chunk_index = index, "消费端已关闭，停止解析");
            return;
        }

        let mut rows = Vec::with_capacity(chunk_size);
        let mut malformed = 0u64;
        let mut consumed = 0usize;
        let first_row = row_number + 1;

        while consumed < chunk_size {
            match reader.read_byte_record(&mut record) {
                Ok(false) => {
                    eof = true;
                    break;
                }
                Ok(true) => {
                    row_number += 1;
                    consumed += 1;
                    match decode_record(&record) {
                        Some(fields) => rows.push(RawRow { row_number, fields }),
                        None => {
                            malformed += 1;
                            warn!(row = row_number, "行编码无效，已跳过");
                        }
                    }
                }
                Err(e) if e.is_io_error() => {
                    let _ = data_tx.blocking_send(Err(ImportError::FileReadError(e.to_string())));
                    return;
                }
                Err(e) => {
                    row_number += 1;
                    consumed += 1;
                    malformed += 1;
                    warn!(row = row_number, error = %e, "行解析失败，已跳过");
                }
            }
        }

        if consumed == 0 {
            return;
        }

        let chunk = Chunk {
            index,
            rows,
            malformed,
            bytes_read: reader.position().byte(),
            first_row,
            last_row: row_number,
        };
        if data_tx.blocking_send(Ok(chunk)).is_err() {
            return;
        }
        index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_file(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn config(chunk_size: usize) -> StreamConfig {
        StreamConfig {
            chunk_size,
            delimiter: None,
        }
    }

    #[test]
    fn test_detect_delimiter() {
        assert_eq!(detect_delimiter(b"a,b,c\n"), b',');
        assert_eq!(detect_delimiter(b"a;b;c\n"), b';');
        assert_eq!(detect_delimiter(b"a\tb\tc\n"), b'\t');
        assert_eq!(detect_delimiter(b"\"x,y\"|b|c\n"), b'|');
        assert_eq!(detect_delimiter(b"single\n"), b',');
    }

    #[test]
    fn test_progress_and_estimate() {
        assert_eq!(progress_for_bytes(0, 100), 5);
        assert_eq!(progress_for_bytes(50, 100), 50);
        assert_eq!(progress_for_bytes(100, 100), 95);
        assert_eq!(estimate_total_rows(10, 100, 1000), Some(100));
        assert_eq!(estimate_total_rows(0, 0, 1000), None);
    }

    #[tokio::test]
    async fn test_chunks_in_order() {
        let file = write_file(b"Supplier,EAN,Stock\nAcme,111,5\nAcme,222,7\nBeta,333,1\n");
        let mut stream = ChunkStream::open(file.path(), &config(2)).await.unwrap();
        assert_eq!(stream.headers(), &["Supplier", "EAN", "Stock"]);

        let first = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.rows.len(), 2);
        assert_eq!(first.first_row, 1);
        assert_eq!(first.last_row, 2);
        assert_eq!(first.rows[1].fields, vec!["Acme", "222", "7"]);

        let second = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.rows.len(), 1);
        assert_eq!(second.rows[0].row_number, 3);
        assert!(second.bytes_read > first.bytes_read);
        assert!(second.bytes_read <= stream.file_len());

        assert!(stream.next_chunk().await.unwrap().is_none());
        assert!(stream.next_chunk().await.unwrap().is_none());
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bom_and_semicolon() {
        let file = write_file("\u{feff}Name;Price\nWidget;1,50\n".as_bytes());
        let mut stream = ChunkStream::open(file.path(), &config(10)).await.unwrap();
        assert_eq!(stream.delimiter(), b';');
        assert_eq!(stream.headers(), &["Name", "Price"]);
        let chunk = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk.rows[0].fields, vec!["Widget", "1,50"]);
    }

    #[tokio::test]
    async fn test_malformed_and_ragged_rows() {
        let mut bytes = b"a,b\n1,2\n".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe, b',', b'x', b'\n']);
        bytes.extend_from_slice(b"3\n4,5,6\n");
        let file = write_file(&bytes);

        let mut stream = ChunkStream::open(file.path(), &config(10)).await.unwrap();
        let chunk = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk.malformed, 1);
        assert_eq!(chunk.rows.len(), 3);
        assert_eq!(chunk.rows_consumed(), 4);
        assert_eq!(chunk.rows[1].row_number, 3);
        assert_eq!(chunk.rows[2].fields.len(), 3);
    }

    #[tokio::test]
    async fn test_open_errors() {
        let err = ChunkStream::open("/nonexistent/file.csv", &config(10))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ImportError::FileNotFound(_)));

        let empty = write_file(b"");
        let err = ChunkStream::open(empty.path(), &config(10)).await.err().unwrap();
        assert!(matches!(err, ImportError::HeaderParseError(_)));
    }

    #[tokio::test]
    async fn test_close_before_drained() {
        let mut content = String::from("a\n");
        for i in 0..100 {
            content.push_str(&format!("{}\n", i));
        }
        let file = write_file(content.as_bytes());
        let mut stream = ChunkStream::open(file.path(), &config(5)).await.unwrap();
        let chunk = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk.rows.len(), 5);
        stream.close().await.unwrap();
    }
}
