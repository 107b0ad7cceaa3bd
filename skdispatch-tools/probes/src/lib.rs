#![no_std]
pub mod echo_dispatch;
