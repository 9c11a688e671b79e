pub mod helpers;

mod tests_merge;
mod tests_recovery;
