mod helpers;



mod tests_compaction;

mod tests_recovery;

mod tests_concurrency;
