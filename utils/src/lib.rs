//! Helpers for exercising a display sink without a real producer or display:
//! a test pattern generator and a display device backed by heap memory.
pub mod framegen;
pub mod virtual_display;
