/// Detection box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelBox {
    pub top: f64,
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
}

impl PixelBox {
    /// Scales a normalized `[top, left, bottom, right]` box to the image size.
    pub fn from_normalized(b: [f32; 4], image_width: u32, image_height: u32) -> Self {
        let (w, h) = (image_width as f64, image_height as f64);
        Self {
            top: b[0] as f64 * h,
            left: b[1] as f64 * w,
            bottom: b[2] as f64 * h,
            right: b[3] as f64 * w,
        }
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.bottom - self.top
    }
}

/// Integer crop region. `bottom` and `right` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub top: u32,
    pub left: u32,
    pub bottom: u32,
    pub right: u32,
}

impl CropBox {
    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

/// Pads `bbox` to a square of side `padding_factor * max(w, h)` centred on
/// the box, clamps it to the image and truncates to integers.
///
/// Returns `None` when nothing of the crop is left inside the image.
pub fn compute_crop_box(
    bbox: &PixelBox,
    image_width: u32,
    image_height: u32,
    padding_factor: f64,
) -> Option<CropBox> {
    let (w, h) = (bbox.width(), bbox.height());
    let side = padding_factor * w.max(h);
    let offset_w = (side - w) / 2.0;
    let offset_h = (side - h) / 2.0;

    let (max_x, max_y) = (image_width as f64, image_height as f64);
    let crop = CropBox {
        top: (bbox.top - offset_h).clamp(0.0, max_y) as u32,
        left: (bbox.left - offset_w).clamp(0.0, max_x) as u32,
        bottom: (bbox.bottom + offset_h).clamp(0.0, max_y) as u32,
        right: (bbox.right + offset_w).clamp(0.0, max_x) as u32,
    };

    if crop.right <= crop.left || crop.bottom <= crop.top {
        return None;
    }
    Some(crop)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pbox(t: f64, l: f64, b: f64, r: f64) -> PixelBox {
        PixelBox { top: t, left: l, bottom: b, right: r }
    }

    #[test]
    fn pads_symmetrically_inside_image() {
        let crop = compute_crop_box(&pbox(10.0, 10.0, 50.0, 50.0), 100, 100, 1.44).unwrap();
        assert_eq!(crop, CropBox { top: 1, left: 1, bottom: 58, right: 58 });
    }

    #[test]
    fn default_padding_clamps_at_origin() {
        // side 67.6, offset 13.8 on each side
        let crop = compute_crop_box(&pbox(10.0, 10.0, 50.0, 50.0), 100, 100, 1.69).unwrap();
        assert_eq!(crop, CropBox { top: 0, left: 0, bottom: 63, right: 63 });
    }

    #[test]
    fn squares_up_the_short_side() {
        // 20 tall, 60 wide: vertical offset 20, horizontal offset 0
        let crop = compute_crop_box(&pbox(40.0, 20.0, 60.0, 80.0), 200, 200, 1.0).unwrap();
        assert_eq!(crop, CropBox { top: 20, left: 20, bottom: 80, right: 80 });
        assert_eq!(crop.width(), crop.height());
    }

    #[test]
    fn clamps_to_far_edges() {
        let crop = compute_crop_box(&pbox(80.0, 90.0, 100.0, 100.0), 100, 100, 2.0).unwrap();
        assert_eq!(crop.bottom, 100);
        assert_eq!(crop.right, 100);
    }

    #[test]
    fn collapsed_box_is_none() {
        assert!(compute_crop_box(&pbox(10.0, 10.0, 10.0, 10.0), 100, 100, 1.69).is_none());
        // entirely outside the image
        assert!(compute_crop_box(&pbox(150.0, 150.0, 160.0, 160.0), 100, 100, 1.0).is_none());
    }

    #[test]
    fn crop_contains_box_and_stays_in_bounds() {
        let (iw, ih) = (320u32, 240u32);
        for i in 0..40u32 {
            let t = (i * 7 % 200) as f64;
            let l = (i * 13 % 300) as f64;
            let b = (t + 1.0 + (i * 5 % 40) as f64).min(ih as f64);
            let r = (l + 1.0 + (i * 11 % 60) as f64).min(iw as f64);
            let bbox = pbox(t, l, b, r);
            for pad in [1.0, 1.3, 1.69, 2.5] {
                let crop = compute_crop_box(&bbox, iw, ih, pad).unwrap();
                assert!(crop.top as f64 <= t && crop.left as f64 <= l);
                assert!(crop.bottom as f64 >= b.floor() && crop.right as f64 >= r.floor());
                assert!(crop.bottom <= ih && crop.right <= iw);
                // truncation can shift each edge by less than a pixel
                let side = pad * bbox.width().max(bbox.height());
                assert!(crop.width() as f64 <= side + 1.0 && crop.height() as f64 <= side + 1.0);
            }
        }
    }

    #[test]
    fn normalized_boxes_scale_by_height_then_width() {
        let b = PixelBox::from_normalized([0.5, 0.25, 1.0, 0.75], 200, 100);
        assert_eq!(b, pbox(50.0, 50.0, 100.0, 150.0));
    }
}
