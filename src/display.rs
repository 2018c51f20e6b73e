// display.rs — Show images side by side in a minifb window.
//
// Compiled only with the `display` feature. Panels are laid out left to
// right at native resolution; the window stays open until Escape or close.

use crate::image::Image;

/// Pack an RGB triple into an ARGB u32 for minifb.
#[inline]
fn rgb_to_u32(r: u8, g: u8, b: u8) -> u32 {
    0xFF00_0000 | ((r as u32) << 16) | ((g as u32) << 8) | b as u32
}

/// Blit each image into one framebuffer and run the window loop.
pub fn show(panels: &[(&str, &Image)]) -> Result<(), minifb::Error> {
    if panels.is_empty() {
        return Ok(());
    }
    let total_w: usize = panels.iter().map(|(_, img)| img.width()).sum();
    let total_h = panels.iter().map(|(_, img)| img.height()).max().unwrap_or(0);

    let mut fb = vec![0u32; total_w * total_h];
    let mut x0 = 0;
    for (_, img) in panels {
        for y in 0..img.height() {
            for x in 0..img.width() {
                let px = if img.is_color() {
                    rgb_to_u32(img.plane(0).get(x, y), img.plane(1).get(x, y), img.plane(2).get(x, y))
                } else {
                    let v = img.plane(0).get(x, y);
                    rgb_to_u32(v, v, v)
                };
                fb[y * total_w + x0 + x] = px;
            }
        }
        x0 += img.width();
    }

    let title = panels.iter().map(|(label, _)| *label).collect::<Vec<_>>().join(" | ");
    let mut window = minifb::Window::new(
        &title,
        total_w,
        total_h,
        minifb::WindowOptions { resize: false, ..Default::default() },
    )?;
    window.limit_update_rate(Some(std::time::Duration::from_millis(16)));

    log::info!("window open, press Escape or close to exit");
    while window.is_open() && !window.is_key_down(minifb::Key::Escape) {
        window.update_with_buffer(&fb, total_w, total_h)?;
    }
    Ok(())
}
