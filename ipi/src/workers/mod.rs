pub mod base;
pub mod reload;
pub mod updater;
pub mod watcher;
