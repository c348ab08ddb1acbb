pub mod hasher;
pub mod image_file;
pub mod scanner;
