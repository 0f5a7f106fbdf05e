use nalgebra::Vector3;

/// Luminous efficacy used to turn relative luminance into photometric units (lm/W).
pub const LUMINOUS_EFFICACY: f32 = 179.0;

/// Gamma of the capture device's transfer curve.
pub const CAPTURE_GAMMA: f32 = 2.2;

/// Rec. 709 relative luminance.
#[inline]
pub fn luminance(rgb: &Vector3<f32>) -> f32 {
    0.2126 * rgb.x + 0.7152 * rgb.y + 0.0722 * rgb.z
}

/// Photometric luminance (relative luminance scaled by the luminous efficacy).
#[inline]
pub fn photometric_luminance(rgb: &Vector3<f32>) -> f32 {
    luminance(rgb) * LUMINOUS_EFFICACY
}

/// Builds the 8-bit lookup table `out = 255 * (in / 255)^(1 / gamma)`.
pub fn gamma_lut(gamma: f32) -> [u8; 256] {
    let inv_gamma = 1.0 / gamma;
    let mut lut = [0u8; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        let normalized = i as f32 / 255.0;
        *entry = (255.0 * normalized.powf(inv_gamma)).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Applies a gamma lookup table to every channel of an RGB image in place.
pub fn adjust_gamma(image: &mut image::RgbImage, gamma: f32) {
    let lut = gamma_lut(gamma);
    for channel in image.iter_mut() {
        *channel = lut[*channel as usize];
    }
}

/// Confidence of an 8-bit sample: 1 at mid-gray, falling to 0 at black and near saturation.
#[inline]
pub fn sample_confidence(value: f32) -> f32 {
    if value > 127.0 {
        (256.0 - value) / 127.0
    } else {
        value / 127.0
    }
}

/// Exposure value of an illuminance, `log2(il / 2.5)`.
#[inline]
pub fn illuminance_to_ev(illuminance: f32) -> f32 {
    (illuminance / 2.5).log2()
}

/// ACES (Academy Color Encoding System) filmic tone mapping curve.
/// Maps high dynamic range (HDR) values to [0, 1] range with a film-like look.
pub fn aces_tone_mapping(color: Vector3<f32>) -> Vector3<f32> {
    let a = 2.51;
    let b = 0.03;
    let c = 2.43;
    let d = 0.59;
    let e = 0.14;

    color.map(|x| ((x * (a * x + b)) / (x * (c * x + d) + e)).clamp(0.0, 1.0))
}

/// Converts linear RGB to display RGB with the capture gamma.
pub fn linear_to_srgb(color: Vector3<f32>) -> Vector3<f32> {
    color.map(|x| x.max(0.0).powf(1.0 / CAPTURE_GAMMA))
}

/// Tone maps an HDR color into an 8-bit display pixel.
pub fn to_display(color: Vector3<f32>, exposure: f32) -> [u8; 3] {
    let srgb = linear_to_srgb(aces_tone_mapping(color * exposure));
    [
        (srgb.x * 255.0) as u8,
        (srgb.y * 255.0) as u8,
        (srgb.z * 255.0) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gamma_round_trip_stays_within_quantization() {
        let forward = gamma_lut(CAPTURE_GAMMA);
        let backward = gamma_lut(1.0 / CAPTURE_GAMMA);
        for value in 0..=255u8 {
            let restored = backward[forward[value as usize] as usize];
            let error = (restored as i32 - value as i32).abs();
            assert!(error <= 2, "{value} came back as {restored}");
        }
    }

    #[test]
    fn gamma_lut_keeps_endpoints() {
        let lut = gamma_lut(CAPTURE_GAMMA);
        assert_eq!(lut[0], 0);
        assert_eq!(lut[255], 255);
        assert!(lut[64] > 64, "inverse gamma should brighten mid tones");
    }

    #[test]
    fn adjust_gamma_uses_lut() {
        let mut img = image::RgbImage::from_pixel(2, 1, image::Rgb([64, 128, 255]));
        adjust_gamma(&mut img, CAPTURE_GAMMA);
        let lut = gamma_lut(CAPTURE_GAMMA);
        assert_eq!(img.get_pixel(1, 0).0, [lut[64], lut[128], 255]);
    }

    #[test]
    fn confidence_peaks_mid_gray() {
        assert_eq!(sample_confidence(0.0), 0.0);
        assert!((sample_confidence(127.0) - 1.0).abs() < 1e-6);
        assert!((sample_confidence(255.0) - 1.0 / 127.0).abs() < 1e-6);
        assert!(sample_confidence(200.0) < sample_confidence(128.0));
    }

    #[test]
    fn luminance_of_white_is_one() {
        let white = Vector3::new(1.0, 1.0, 1.0);
        assert!((luminance(&white) - 1.0).abs() < 1e-6);
        assert!((photometric_luminance(&white) - LUMINOUS_EFFICACY).abs() < 1e-3);
        assert!((illuminance_to_ev(10.0) - 2.0).abs() < 1e-6);
    }
}
