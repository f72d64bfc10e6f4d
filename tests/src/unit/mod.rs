mod http_backend_tests;
mod state_tests;
