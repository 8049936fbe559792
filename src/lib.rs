pub mod concurrency;
pub mod dfu;
pub mod frame;
pub mod gvd;
pub mod pipeline;
pub mod usb;
pub mod uvc;
