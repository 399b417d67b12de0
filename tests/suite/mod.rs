mod common;
mod corefile;
mod debuginfo;
mod process;
mod registry;
mod symbols;
