use fieldops_storage::conformance::run_conformance_suite;
use fieldops_storage::MemoryStore;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_store_passes_conformance_suite() {
    let report = run_conformance_suite(|| async { MemoryStore::new() }).await;
    assert!(report.total > 0);
    assert_eq!(report.failed, 0, "{report}");
}
