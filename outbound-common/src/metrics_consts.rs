pub const DOCUMENTS_DECODE_ERRORS: &str = "outbound_documents_decode_errors_total";
pub const TRACKED_ERRORS: &str = "outbound_tracked_errors_total";

pub const CACHE_HITS: &str = "outbound_enrichment_cache_hits_total";
pub const CACHE_MISSES: &str = "outbound_enrichment_cache_misses_total";
pub const CACHE_FAULTS: &str = "outbound_enrichment_cache_faults_total";
pub const ENRICHMENT_FAILURES: &str = "outbound_enrichment_failures_total";
pub const TOKENIZER_CALLS: &str = "outbound_tokenizer_calls_total";
pub const TOKENIZER_FAILURES: &str = "outbound_tokenizer_failures_total";

pub const DOCUMENTS_PUBLISHED: &str = "outbound_documents_published_total";
pub const DOCUMENTS_PUBLISH_FAILED: &str = "outbound_documents_publish_failed_total";
pub const PUBLISH_BATCH_SIZE: &str = "outbound_publish_batch_size";

pub const BATCHES_PROCESSED: &str = "outbound_batches_processed_total";
pub const AUDIT_ROWS_WRITTEN: &str = "outbound_audit_rows_written_total";
pub const AUDIT_ROWS_FAILED: &str = "outbound_audit_rows_failed_total";
