//! BT.601 full-range conversion between RGBA8 and planar I420.

use rayon::prelude::*;

/// Bytes in one I420 picture.
pub fn i420_len(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    w * h + 2 * cw * ch
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Convert a top-down RGBA8 picture to I420.
pub fn rgba_to_i420(width: u32, height: u32, rgba: &[u8]) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let mut out = vec![0u8; i420_len(width, height)];
    let (y_plane, chroma) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    y_plane
        .par_chunks_mut(w.max(1))
        .enumerate()
        .for_each(|(y, row)| {
            for (x, luma) in row.iter_mut().enumerate() {
                let i = (y * w + x) * 4;
                let (r, g, b) = (rgba[i] as f32, rgba[i + 1] as f32, rgba[i + 2] as f32);
                *luma = clamp_u8(0.299 * r + 0.587 * g + 0.114 * b);
            }
        });

    u_plane
        .par_chunks_mut(cw.max(1))
        .zip(v_plane.par_chunks_mut(cw.max(1)))
        .enumerate()
        .for_each(|(cy, (u_row, v_row))| {
            for cx in 0..cw {
                let (mut r, mut g, mut b, mut n) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
                for dy in 0..2 {
                    for dx in 0..2 {
                        let (x, y) = (cx * 2 + dx, cy * 2 + dy);
                        if x < w && y < h {
                            let i = (y * w + x) * 4;
                            r += rgba[i] as f32;
                            g += rgba[i + 1] as f32;
                            b += rgba[i + 2] as f32;
                            n += 1.0;
                        }
                    }
                }
                let (r, g, b) = (r / n, g / n, b / n);
                u_row[cx] = clamp_u8(-0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0);
                v_row[cx] = clamp_u8(0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0);
            }
        });

    out
}

/// Convert an I420 picture to top-down RGBA8 with opaque alpha.
pub fn i420_to_rgba(width: u32, height: u32, yuv: &[u8]) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let (y_plane, chroma) = yuv.split_at(w * h);
    let (u_plane, v_plane) = chroma.split_at(cw * ch);
    let mut out = vec![0u8; w * h * 4];

    out.par_chunks_mut((w * 4).max(1))
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..w {
                let luma = y_plane[y * w + x] as f32;
                let ci = (y / 2) * cw + x / 2;
                let u = u_plane[ci] as f32 - 128.0;
                let v = v_plane[ci] as f32 - 128.0;
                let px = &mut row[x * 4..x * 4 + 4];
                px[0] = clamp_u8(luma + 1.402 * v);
                px[1] = clamp_u8(luma - 0.344_136 * u - 0.714_136 * v);
                px[2] = clamp_u8(luma + 1.772 * u);
                px[3] = 255;
            }
        });

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> Vec<u8> {
        (0..w * h)
            .flat_map(|_| [rgb[0], rgb[1], rgb[2], 255])
            .collect()
    }

    #[test]
    fn test_plane_sizes() {
        assert_eq!(i420_len(4, 2), 8 + 2 + 2);
        assert_eq!(i420_len(3, 3), 9 + 4 + 4);
    }

    #[test]
    fn test_grey_is_neutral_chroma() {
        let yuv = rgba_to_i420(2, 2, &solid(2, 2, [128, 128, 128]));
        assert_eq!(yuv, vec![128, 128, 128, 128, 128, 128]);
    }

    #[test]
    fn test_primary_colours_survive_conversion() {
        for rgb in [[255, 0, 0], [0, 255, 0], [0, 0, 255], [20, 200, 90]] {
            let back = i420_to_rgba(4, 4, &rgba_to_i420(4, 4, &solid(4, 4, rgb)));
            for px in back.chunks_exact(4) {
                for c in 0..3 {
                    assert!(
                        (px[c] as i32 - rgb[c] as i32).abs() <= 2,
                        "{rgb:?} came back as {px:?}"
                    );
                }
                assert_eq!(px[3], 255);
            }
        }
    }

    #[test]
    fn test_odd_dimensions() {
        let back = i420_to_rgba(3, 1, &rgba_to_i420(3, 1, &solid(3, 1, [10, 20, 30])));
        assert_eq!(back.len(), 12);
    }
}
