#[derive(Debug, thiserror::Error)]
pub enum SlmWavefrontError {
    #[error("invalid aperture geometry")]
    Aperture(#[from] crate::ApertureError),
    #[error("cannot compose the SLM phase mask")]
    Mask(#[from] crate::MaskError),
    #[error("device failure")]
    Device(#[from] crate::DeviceError),
    #[error("cannot assemble the wavefront maps")]
    PhaseMap(#[from] crate::PhaseMapError),
    #[error("wavefront measurement failed")]
    Measurement(#[from] crate::MeasurementError),
    #[error("cannot load `::slm_wavefront::MeasurementBuilder`")]
    Config(#[from] crate::measurement::MeasurementBuilderError),
}
