// Ingest Agent's Test Infrastructure
//
// Cross-module tests live here; unit tests for a single module stay inline
// next to the code they cover.

// ============================================================================
// SHARED HELPERS - Test doubles for extraction and ingestion
// ============================================================================
pub mod support;



// ============================================================================
// INTEGRATION TESTS - Watch manager on real directories
// ============================================================================
pub mod watcher_tests;
