mod helpers;

mod batch_tests;
mod cache_tests;
mod port_tests;
mod stream_tests;
