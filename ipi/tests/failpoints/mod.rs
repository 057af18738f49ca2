mod reload_test;
mod updater_test;
