use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use idscan_core::FieldBox;

/// Outline each box on an RGB copy of `canonical`, `thickness` pixels wide,
/// growing inward so the outline never leaves the box.
pub fn draw_field_boxes<'a>(
    canonical: &GrayImage,
    boxes: impl IntoIterator<Item = &'a FieldBox>,
    color: Rgb<u8>,
    thickness: u32,
) -> RgbImage {
    let mut canvas = DynamicImage::ImageLuma8(canonical.clone()).to_rgb8();
    for bbox in boxes {
        for inset in 0..thickness.max(1) {
            let (w, h) = (bbox.width(), bbox.height());
            if w <= inset * 2 || h <= inset * 2 {
                break;
            }
            let rect = Rect::at((bbox.x1 + inset) as i32, (bbox.y1 + inset) as i32)
                .of_size(w - inset * 2, h - inset * 2);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }
    }
    canvas
}
