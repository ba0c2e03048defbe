pub mod converter;
pub mod decoder;
pub mod frame;
pub mod frame_decoder;
pub mod inverter;
pub mod parameter;
pub mod schema;
