// THEORY (single-pixel color heuristics):
// The `pixel` module is the most fundamental unit of the labeler. It is a
// "dumb" data container for one RGB sample plus the handful of 1-dimensional
// heuristics the color segmenter needs: hue, HSV saturation and HSV value.
// Nothing here reads neighbors; spatial logic lives in the segmenter and cleaner.
//
// Scales follow the marker profiles in `config`: hue in degrees [0, 360),
// saturation and value in [0, 255]. Using the full hue circle (rather than a
// half-range byte encoding) keeps red's wraparound explicit in the ranges.

pub mod pixel {
    pub type Channel = u8;
    pub type NormalizedChannel = f32;
    pub type Hue = f32;
    pub type SaturationHSV = f32;
    pub type ValueHSV = f32;

    /// A single RGB sample with its channels pre-normalized.
    #[derive(Debug, Clone, Copy, PartialEq, Default)]
    pub struct Pixel {
        pub red: Channel,
        pub green: Channel,
        pub blue: Channel,
        /// The red channel value (0.0-1.0).
        pub red_normalized: NormalizedChannel,
        /// The green channel value (0.0-1.0).
        pub green_normalized: NormalizedChannel,
        /// The blue channel value (0.0-1.0).
        pub blue_normalized: NormalizedChannel,
    }

    impl Pixel {
        pub fn new(red: Channel, green: Channel, blue: Channel) -> Self {
            Pixel {
                red,
                green,
                blue,
                red_normalized: red as NormalizedChannel / 255.0,
                green_normalized: green as NormalizedChannel / 255.0,
                blue_normalized: blue as NormalizedChannel / 255.0,
            }
        }

        fn max_channel(&self) -> NormalizedChannel {
            self.red_normalized
                .max(self.green_normalized.max(self.blue_normalized))
        }

        fn min_channel(&self) -> NormalizedChannel {
            self.red_normalized
                .min(self.green_normalized.min(self.blue_normalized))
        }

        /// Hue angle in degrees [0, 360). Achromatic pixels report 0.
        pub fn hue(&self) -> Hue {
            let maximum_channel = self.max_channel();
            let chroma = maximum_channel - self.min_channel();

            if chroma <= 1e-6 {
                return 0.0;
            }

            let inverse_chroma = 1.0 / chroma;

            let (base_difference, sector_offset) = if maximum_channel == self.red_normalized {
                (self.green_normalized - self.blue_normalized, 0.0)
            } else if maximum_channel == self.green_normalized {
                (self.blue_normalized - self.red_normalized, 2.0)
            } else {
                (self.red_normalized - self.green_normalized, 4.0)
            };

            let mut hue_degrees = (base_difference * inverse_chroma + sector_offset) * 60.0;
            if hue_degrees < 0.0 {
                hue_degrees += 360.0;
            }
            hue_degrees
        }

        /// HSV saturation on the byte scale [0, 255].
        pub fn saturation_hsv(&self) -> SaturationHSV {
            let maximum_channel = self.max_channel();
            if maximum_channel <= 1e-6 {
                return 0.0;
            }
            (maximum_channel - self.min_channel()) / maximum_channel * 255.0
        }

        /// HSV value on the byte scale [0, 255].
        pub fn value_hsv(&self) -> ValueHSV {
            self.max_channel() * 255.0
        }

        /// `(hue, saturation, value)` in the units the marker profiles use.
        pub fn hsv(&self) -> (Hue, SaturationHSV, ValueHSV) {
            (self.hue(), self.saturation_hsv(), self.value_hsv())
        }
    }

    impl From<&image::Rgb<u8>> for Pixel {
        fn from(rgb: &image::Rgb<u8>) -> Self {
            Pixel::new(rgb[0], rgb[1], rgb[2])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::pixel::Pixel;
    use approx::assert_abs_diff_eq;

    #[test]
    fn primary_colors_land_on_their_hue() {
        assert_abs_diff_eq!(Pixel::new(255, 0, 0).hue(), 0.0);
        assert_abs_diff_eq!(Pixel::new(0, 255, 0).hue(), 120.0);
        assert_abs_diff_eq!(Pixel::new(0, 0, 255).hue(), 240.0);
    }

    #[test]
    fn magenta_leaning_red_wraps_near_360() {
        let hue = Pixel::new(255, 0, 40).hue();
        assert!(hue > 340.0 && hue < 360.0, "hue was {hue}");
    }

    #[test]
    fn grey_is_unsaturated() {
        let (hue, sat, val) = Pixel::new(128, 128, 128).hsv();
        assert_abs_diff_eq!(hue, 0.0);
        assert_abs_diff_eq!(sat, 0.0);
        assert_abs_diff_eq!(val, 128.0, epsilon = 1e-3);
    }

    #[test]
    fn black_has_zero_saturation_and_value() {
        let (_, sat, val) = Pixel::new(0, 0, 0).hsv();
        assert_abs_diff_eq!(sat, 0.0);
        assert_abs_diff_eq!(val, 0.0);
    }

    #[test]
    fn marker_red_is_strongly_saturated() {
        let (hue, sat, val) = Pixel::from(&image::Rgb([220, 30, 30])).hsv();
        assert!(hue < 20.0);
        assert!(sat > 200.0);
        assert_abs_diff_eq!(val, 220.0, epsilon = 1e-3);
    }
}
