// ==========================================
// 供应商目录导入系统 - 导入层
// ==========================================
// 职责: 分隔文本流式导入，身份匹配，分批落库
// 流程: 分块读取 → 表头映射 → 行投影 → 身份匹配 → 批量写入 → 进度
// ==========================================

// 模块声明
pub mod batch_writer;
pub mod chunk_stream;
pub mod column_mapper;
pub mod error;
pub mod identifier;
pub mod identity_resolver;
pub mod memory_governor;
pub mod pipeline;
pub mod progress_tracker;
pub mod row_projector;

// 重导出
pub use batch_writer::{BatchFailure, BatchWriter, ChunkWriteReport, DedupeReport, WriteStage};
pub use chunk_stream::{Chunk, ChunkStream, RawRow};
pub use column_mapper::{ColumnMapper, ColumnMapping, FieldDictionary};
pub use error::{ImportError, ImportResult};
pub use identity_resolver::{CandidateIndex, IdentityResolver, MpnBackfill, Resolution};
pub use memory_governor::{MemoryGovernor, MemorySampler, SysinfoSampler};
pub use pipeline::ImportPipeline;
pub use progress_tracker::{JobOutcome, ProgressTracker};
pub use row_projector::{CandidateRecord, Projected, RowProjector, SkipReason};
