use crate::config::ConverterConfig;
use crate::services::converter::{ImageConverter, announce, create_converter};
use std::sync::Arc;

pub async fn setup_converter(config: &ConverterConfig) -> Arc<dyn ImageConverter> {
    let converter = create_converter(&config.converter_backend);

    // Probe the backend once so a missing binary shows up at start-up
    announce(converter.as_ref()).await;

    converter
}
