mod lifecycle_test;
mod process_test;
mod reload_test;
mod updater_test;
mod watcher_test;
