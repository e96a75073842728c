pub const INTEGRITY_CORRECTIONS: &str = "account_mirror_integrity_corrections_total";
pub const DECODE_MISSES: &str = "account_mirror_decode_misses_total";
pub const EVENTS_RECEIVED: &str = "account_mirror_events_received_total";
pub const EVENTS_IRRELEVANT: &str = "account_mirror_events_irrelevant_total";
pub const ROWS_WRITTEN: &str = "account_mirror_rows_written_total";
pub const ROWS_DELETED: &str = "account_mirror_rows_deleted_total";
pub const ROWS_GARBAGE_COLLECTED: &str = "account_mirror_rows_garbage_collected_total";
pub const WRITE_FAILURES: &str = "account_mirror_write_failures_total";
pub const PROCESS_DURATION: &str = "account_mirror_process_duration_seconds";
pub const CURSOR_FLUSHES: &str = "account_mirror_cursor_flushes_total";
pub const CURSOR_BLOCK_HEIGHT: &str = "account_mirror_cursor_block_height";
pub const SOURCE_RECONNECTS: &str = "account_mirror_source_reconnects_total";
pub const SOURCE_STALE: &str = "account_mirror_source_stale_total";
pub const UNAUTHORIZED_MESSAGES: &str = "account_mirror_unauthorized_messages_total";
pub const REFRESH_ACCOUNTS: &str = "account_mirror_refresh_accounts_total";
pub const REFRESH_DURATION: &str = "account_mirror_refresh_duration_seconds";
pub const GEOCODE_LOOKUPS: &str = "account_mirror_geocode_lookups_total";
pub const RPC_REQUESTS: &str = "account_mirror_rpc_requests_total";
pub const HTTP_REQUESTS: &str = "account_mirror_http_requests_total";
pub const HTTP_REQUEST_DURATION: &str = "account_mirror_http_request_duration_seconds";
