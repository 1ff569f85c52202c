pub mod pw;
