//! Outbound adapters: the call-log source client and the transcript extraction engine.

mod extraction;
mod llm;
mod source;

pub use extraction::{
    ExtractionConfig, ExtractionEngine, ExtractionError, StructuredExtractor,
    MIN_EXTRACTABLE_CHARS,
};
pub use llm::{parse_completion, LlmConfig, LlmExtractor, EXTRACTION_PROMPT};
pub use source::{
    fetch_records, parse_call_page, query_params, record_stream, CallFilter, CallPage, CallSource,
    HttpCallSource, PageRequest, SourceError, MAX_PAGE_SIZE,
};

pub const CRATE_NAME: &str = "callsync-adapters";
