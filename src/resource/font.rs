// Font resources
//
// Glyphs are rasterized with freetype on the loader thread and packed
// into one or more square atlas layers with a shelf packer. The
// finished layers become an array texture subresource; the font's
// status follows that texture once the load function has run.

use freetype as ft;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::mesh::{Color8, Rect2};
use crate::resource::{ManagerRef, Resource, ResourceCommon, ResourceStatus, ThreadLoaderResource};
use crate::resource::texture::TextureResource;
use crate::{Result, SquallError};

use cgmath::Vector2;
use std::sync::Arc;

/// Weight of the maximum glyph size against the average when
/// estimating atlas space. Absorbs outlier glyphs.
const AVERAGE_TO_MAX_WEIGHT: f64 = 0.05;
/// Lower bound for the atlas side length.
const MINIMUM_ATLAS_SIZE: u32 = 128;

#[derive(Debug, Clone, Copy)]
pub struct FontCreateInfo {
    /// Nominal glyph height in texels when rasterizing.
    pub glyph_texel_size: u32,
    /// Padding around each glyph in the atlas.
    pub glyph_atlas_padding: u32,
    /// Character drawn in place of unmapped ones.
    pub fallback_character: char,
    /// Antialiased coverage when true, 1-bit monochrome otherwise.
    pub use_alpha: bool,
}

impl Default for FontCreateInfo {
    fn default() -> Self {
        FontCreateInfo {
            glyph_texel_size: 32,
            glyph_atlas_padding: 2,
            fallback_character: '?',
            use_alpha: true,
        }
    }
}

/// Where one glyph ended up and how to draw with it.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlyphInfo {
    /// Index of the atlas layer holding this glyph.
    pub atlas_index: u32,
    /// Normalized atlas coordinates of the glyph rectangle.
    pub uv_coords: Rect2,
    /// Pen-relative quad for horizontal layout.
    pub horizontal_coords: Rect2,
    /// Pen-relative quad for vertical layout.
    pub vertical_coords: Rect2,
    pub horizontal_advance: f32,
    pub vertical_advance: f32,
}

/// One atlas layer: a zeroed pixel square plus the shelf packing
/// cursor.
pub(crate) struct AtlasTexture {
    pub index: u32,
    pub data: Vec<Color8>,
    previous_row_height: u32,
    current_row_height: u32,
    current_write_location: u32,
}

impl AtlasTexture {
    fn new(index: u32, atlas_size: u32) -> Self {
        AtlasTexture {
            index,
            data: vec![Color8::default(); (atlas_size * atlas_size) as usize],
            previous_row_height: 0,
            current_row_height: 0,
            current_write_location: 0,
        }
    }

    /// Reserve space for a `width`×`height` glyph. Returns the top
    /// left corner, or None when this atlas layer is out of room.
    /// Advances to the next shelf row when the current row is full.
    fn reserve(
        &mut self,
        width: u32,
        height: u32,
        padding: u32,
        atlas_size: u32,
    ) -> Option<(u32, u32)> {
        let padded_width = width + padding;
        let padded_height = height + padding;

        if self.previous_row_height + padded_height + padding >= atlas_size {
            return None;
        }

        if self.current_write_location + padded_width + padding >= atlas_size {
            // Row is full, open a new one and retry the height check.
            self.previous_row_height += self.current_row_height;
            self.current_row_height = 0;
            self.current_write_location = 0;

            if self.previous_row_height + padded_height + padding >= atlas_size {
                return None;
            }
            if self.current_write_location + padded_width + padding >= atlas_size {
                // A fresh row cannot hold the glyph either: the glyph
                // is wider than the atlas itself.
                return None;
            }
        }

        let location = (
            self.current_write_location + padding,
            self.previous_row_height + padding,
        );
        self.current_row_height = self.current_row_height.max(padded_height);
        self.current_write_location += padded_width;
        Some(location)
    }

    fn blit(&mut self, location: (u32, u32), width: u32, pixels: &[Color8], atlas_size: u32) {
        for (i, texel) in pixels.iter().enumerate() {
            let gx = i as u32 % width;
            let gy = i as u32 / width;
            let index = (location.1 + gy) * atlas_size + location.0 + gx;
            self.data[index as usize] = *texel;
        }
    }
}

struct FaceInfo {
    glyph_infos: Vec<GlyphInfo>,
    charmap: HashMap<u32, u32>,
    fallback_glyph_index: u32,
}

struct FontState {
    atlas_size: u32,
    atlas_count: u32,
    faces: Vec<FaceInfo>,
    texture: Option<Arc<TextureResource>>,
}

pub struct FontResource {
    fr_common: ResourceCommon,
    fr_manager: ManagerRef,
    fr_info: FontCreateInfo,
    fr_state: Mutex<FontState>,
}

/// Round up to the next power of two.
pub(crate) fn ceiling_power_of_two(value: u32) -> u32 {
    value.max(1).next_power_of_two()
}

/// Convert a freetype bitmap into RGBA8 texels.
fn convert_bitmap(bitmap: &ft::Bitmap) -> Option<Vec<Color8>> {
    let width = bitmap.width() as usize;
    let rows = bitmap.rows() as usize;
    let pitch = bitmap.pitch();
    let buffer = bitmap.buffer();
    let mut texels = vec![Color8::default(); width * rows];

    match bitmap.pixel_mode().ok()? {
        ft::bitmap::PixelMode::Mono => {
            for y in 0..rows {
                for x in 0..width {
                    let byte = buffer[y * pitch as usize + x / 8];
                    let bit = 7 - (x % 8);
                    let value = ((byte >> bit) & 1) * 255;
                    texels[y * width + x] = Color8::new(value, value, value, value);
                }
            }
        }
        ft::bitmap::PixelMode::Gray => {
            for y in 0..rows {
                for x in 0..width {
                    let value = buffer[y * pitch as usize + x];
                    texels[y * width + x] = Color8::new(value, value, value, value);
                }
            }
        }
        ft::bitmap::PixelMode::Bgra => {
            for i in 0..width * rows {
                let src = &buffer[i * 4..i * 4 + 4];
                texels[i] = Color8::new(src[2], src[1], src[0], src[3]);
            }
        }
        _ => {
            log::warn!("unsupported freetype pixel mode");
            return None;
        }
    }
    Some(texels)
}

impl FontResource {
    pub(crate) fn from_file(
        manager: ManagerRef,
        loader_thread: usize,
        path: PathBuf,
        info: FontCreateInfo,
    ) -> Self {
        FontResource {
            fr_common: ResourceCommon::new(loader_thread, false, vec![path]),
            fr_manager: manager,
            fr_info: info,
            fr_state: Mutex::new(FontState {
                atlas_size: 0,
                atlas_count: 0,
                faces: Vec::new(),
                texture: None,
            }),
        }
    }

    pub fn face_count(&self) -> u32 {
        self.fr_state.lock().unwrap().faces.len() as u32
    }

    pub fn face_exists(&self, face_index: u32) -> bool {
        (face_index as usize) < self.fr_state.lock().unwrap().faces.len()
    }

    /// Side length of the (square) atlas layers.
    pub fn atlas_size(&self) -> u32 {
        self.fr_state.lock().unwrap().atlas_size
    }

    pub fn atlas_count(&self) -> u32 {
        self.fr_state.lock().unwrap().atlas_count
    }

    /// The array texture holding the atlas layers, once loaded.
    pub fn texture(&self) -> Option<Arc<TextureResource>> {
        if self.status() != ResourceStatus::Loaded {
            return None;
        }
        self.fr_state.lock().unwrap().texture.clone()
    }

    /// Glyph info for `character`, falling back to the face's
    /// fallback glyph for unmapped characters.
    pub fn glyph_info(&self, face_index: u32, character: char) -> Result<GlyphInfo> {
        let state = self.fr_state.lock().unwrap();
        let face = state
            .faces
            .get(face_index as usize)
            .ok_or(SquallError::INVALID)?;
        let glyph_index = face
            .charmap
            .get(&(character as u32))
            .copied()
            .unwrap_or(face.fallback_glyph_index);
        face.glyph_infos
            .get(glyph_index as usize)
            .copied()
            .ok_or(SquallError::INVALID)
    }

    fn load_inner(&self, tlr: &mut ThreadLoaderResource) -> Option<()> {
        let manager = self.fr_manager.upgrade()?;
        let dev = manager.device().clone();
        let info = self.fr_info;
        let path = self.fr_common.rc_file_paths.first()?.clone();
        let path_str = path.to_string_lossy().into_owned();

        let library = tlr.freetype()?;

        let max_texture_size = dev.limits().max_image_dimension2_d;
        let min_texture_size = MINIMUM_ATLAS_SIZE.min(max_texture_size);

        // Face count probe.
        let face_count = {
            let face = match library.new_face(&path_str, -1) {
                Ok(f) => f,
                Err(e) => {
                    log::warn!("cannot open font {}: {}", path_str, e);
                    return None;
                }
            };
            face.raw().num_faces as usize
        };
        if face_count == 0 {
            return None;
        }

        // First pass: open every face, set the pixel size and gather
        // occupancy statistics for the atlas size estimate.
        let mut faces = Vec::with_capacity(face_count);
        let mut total_glyph_count: u64 = 0;
        let mut max_metrics_size = Vector2::new(0.0f64, 0.0f64);
        let mut max_bitmap_size = Vector2::new(0.0f64, 0.0f64);
        let mut max_occupancy = Vector2::new(0.0f64, 0.0f64);
        let mut occupancy_sum = Vector2::new(0.0f64, 0.0f64);

        for i in 0..face_count {
            let face = library.new_face(&path_str, i as isize).ok()?;
            face.set_pixel_sizes(0, info.glyph_texel_size).ok()?;

            let glyph_count = face.raw().num_glyphs as u32;
            total_glyph_count += glyph_count as u64 + 1;

            for g in 0..glyph_count {
                if face.load_glyph(g, ft::face::LoadFlag::DEFAULT).is_err() {
                    return None;
                }
                let glyph = face.glyph();
                let metrics = glyph.metrics();
                let bitmap = glyph.bitmap();

                let metrics_size = Vector2::new(metrics.width as f64, metrics.height as f64);
                let bitmap_size = Vector2::new(bitmap.width() as f64, bitmap.rows() as f64);
                let occupancy = Vector2::new(
                    bitmap_size.x + info.glyph_atlas_padding as f64,
                    bitmap_size.y + info.glyph_atlas_padding as f64,
                );

                max_metrics_size.x = max_metrics_size.x.max(metrics_size.x);
                max_metrics_size.y = max_metrics_size.y.max(metrics_size.y);
                max_bitmap_size.x = max_bitmap_size.x.max(bitmap_size.x);
                max_bitmap_size.y = max_bitmap_size.y.max(bitmap_size.y);
                max_occupancy.x = max_occupancy.x.max(occupancy.x);
                max_occupancy.y = max_occupancy.y.max(occupancy.y);
                occupancy_sum += occupancy;
            }
            faces.push(face);
        }

        if total_glyph_count == 0 {
            log::warn!("font {} contains no glyphs", path_str);
            return None;
        }

        // Estimate the atlas side length: blend average occupancy
        // with the maximum, aim for one to four layers.
        let padding2 = 2.0 * info.glyph_atlas_padding as f64;
        let average = Vector2::new(
            (occupancy_sum.x + padding2) / total_glyph_count as f64,
            (occupancy_sum.y + padding2) / total_glyph_count as f64,
        );
        let estimated = Vector2::new(
            average.x * (1.0 - AVERAGE_TO_MAX_WEIGHT) + max_occupancy.x * AVERAGE_TO_MAX_WEIGHT,
            average.y * (1.0 - AVERAGE_TO_MAX_WEIGHT) + max_occupancy.y * AVERAGE_TO_MAX_WEIGHT,
        );
        let area_per_layer = (estimated.x / 1.5) * (estimated.y / 1.5) * 1.5;
        let atlas_size = ceiling_power_of_two(
            (area_per_layer.max(1.0) * total_glyph_count as f64).sqrt().ceil() as u32,
        )
        .min(max_texture_size)
        .max(min_texture_size);

        // The conversion between 26.6 metric units and bitmap texels.
        let metrics_to_texels = {
            let rx = if max_metrics_size.x > 0.0 {
                max_bitmap_size.x / max_metrics_size.x
            } else {
                0.0
            };
            let ry = if max_metrics_size.y > 0.0 {
                max_bitmap_size.y / max_metrics_size.y
            } else {
                0.0
            };
            rx.max(ry)
        };

        // Second pass: render every glyph, pack it and record its
        // info.
        let mut atlas_textures = vec![AtlasTexture::new(0, atlas_size)];
        let mut face_infos = Vec::with_capacity(faces.len());

        for face in faces.iter() {
            let glyph_count = face.raw().num_glyphs as u32;
            let mut glyph_infos = Vec::with_capacity(glyph_count as usize);

            for g in 0..glyph_count {
                if face.load_glyph(g, ft::face::LoadFlag::DEFAULT).is_err() {
                    return None;
                }
                let slot = face.glyph();
                let render_mode = if info.use_alpha {
                    ft::render_mode::RenderMode::Normal
                } else {
                    ft::render_mode::RenderMode::Mono
                };
                if slot.render_glyph(render_mode).is_err() {
                    return None;
                }

                let bitmap = slot.bitmap();
                let width = bitmap.width() as u32;
                let height = bitmap.rows() as u32;
                let pixels = convert_bitmap(&bitmap)?;

                // Pack into the current atlas; overflow opens a new
                // layer, and a glyph that cannot fit a fresh layer is
                // larger than the atlas itself.
                let mut target = atlas_textures.len() - 1;
                let location = match atlas_textures[target].reserve(
                    width,
                    height,
                    info.glyph_atlas_padding,
                    atlas_size,
                ) {
                    Some(l) => l,
                    None => {
                        let index = atlas_textures.len() as u32;
                        atlas_textures.push(AtlasTexture::new(index, atlas_size));
                        target = atlas_textures.len() - 1;
                        match atlas_textures[target].reserve(
                            width,
                            height,
                            info.glyph_atlas_padding,
                            atlas_size,
                        ) {
                            Some(l) => l,
                            None => {
                                log::warn!(
                                    "font {}: a single glyph exceeds the atlas size",
                                    path_str
                                );
                                return None;
                            }
                        }
                    }
                };
                let atlas = &mut atlas_textures[target];
                atlas.blit(location, width, &pixels, atlas_size);

                let metrics = slot.metrics();
                let size = Vector2::new(
                    metrics.width as f64 * metrics_to_texels,
                    metrics.height as f64 * metrics_to_texels,
                );
                let hori_top_left = Vector2::new(
                    metrics.horiBearingX as f64 * metrics_to_texels,
                    -metrics.horiBearingY as f64 * metrics_to_texels,
                );
                let vert_top_left = Vector2::new(
                    metrics.vertBearingX as f64 * metrics_to_texels,
                    metrics.vertBearingY as f64 * metrics_to_texels,
                );

                let atlas_index = atlas.index;
                glyph_infos.push(GlyphInfo {
                    atlas_index,
                    uv_coords: Rect2::new(
                        location.0 as f32 / atlas_size as f32,
                        location.1 as f32 / atlas_size as f32,
                        (location.0 + width) as f32 / atlas_size as f32,
                        (location.1 + height) as f32 / atlas_size as f32,
                    ),
                    horizontal_coords: Rect2::new(
                        hori_top_left.x as f32,
                        hori_top_left.y as f32,
                        (hori_top_left.x + size.x) as f32,
                        (hori_top_left.y + size.y) as f32,
                    ),
                    vertical_coords: Rect2::new(
                        vert_top_left.x as f32,
                        vert_top_left.y as f32,
                        (vert_top_left.x + size.x) as f32,
                        (vert_top_left.y + size.y) as f32,
                    ),
                    horizontal_advance: (metrics.horiAdvance as f64 * metrics_to_texels) as f32,
                    vertical_advance: (metrics.vertAdvance as f64 * metrics_to_texels) as f32,
                });
            }

            // Character map plus the fallback glyph.
            let mut charmap = HashMap::new();
            let mut fallback_glyph_index = 0u32;
            unsafe {
                let raw_face = face.raw() as *const ft::ffi::FT_FaceRec as ft::ffi::FT_Face;
                let mut glyph_index: ft::ffi::FT_UInt = 0;
                let mut charcode = ft::ffi::FT_Get_First_Char(raw_face, &mut glyph_index);
                fallback_glyph_index = glyph_index;
                while glyph_index != 0 {
                    charmap.insert(charcode as u32, glyph_index);
                    charcode = ft::ffi::FT_Get_Next_Char(raw_face, charcode, &mut glyph_index);
                }
                let preferred = ft::ffi::FT_Get_Char_Index(
                    raw_face,
                    info.fallback_character as ft::ffi::FT_ULong,
                );
                if preferred != 0 {
                    fallback_glyph_index = preferred;
                }
            }

            face_infos.push(FaceInfo {
                glyph_infos,
                charmap,
                fallback_glyph_index,
            });
        }

        // Faces are done; drop them before creating the texture.
        drop(faces);

        let atlas_count = atlas_textures.len() as u32;
        let layers: Vec<Vec<Color8>> = atlas_textures.into_iter().map(|a| a.data).collect();

        {
            let mut state = self.fr_state.lock().unwrap();
            state.atlas_size = atlas_size;
            state.atlas_count = atlas_count;
            state.faces = face_infos;
        }

        // Everything is baked, hand the layers to the resource
        // manager as this font's array texture subresource.
        let texture = manager
            .create_texture_internal((atlas_size, atlas_size), layers, Some(self))
            .ok()?;
        self.fr_state.lock().unwrap().texture = Some(texture);

        Some(())
    }
}

impl Resource for FontResource {
    fn common(&self) -> &ResourceCommon {
        &self.fr_common
    }

    fn status(&self) -> ResourceStatus {
        if !self.fr_common.load_fence().is_set() {
            return ResourceStatus::Undetermined;
        }
        if !self.fr_common.load_ok() {
            return ResourceStatus::FailedToLoad;
        }
        // The font itself is CPU-side data; its availability follows
        // the atlas texture subresource.
        let texture = self.fr_state.lock().unwrap().texture.clone();
        match texture {
            Some(t) => t.status(),
            None => ResourceStatus::FailedToLoad,
        }
    }

    fn mt_load(&self, tlr: &mut ThreadLoaderResource) -> bool {
        self.load_inner(tlr).is_some()
    }

    fn mt_unload(&self, _tlr: &mut ThreadLoaderResource) {
        // Face handles were released at the end of the load task and
        // the atlas texture is destroyed through the subresource
        // path; only the CPU-side tables remain.
        let mut state = self.fr_state.lock().unwrap();
        state.faces.clear();
        state.texture = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_power_of_two_rounds_up() {
        assert_eq!(ceiling_power_of_two(1), 1);
        assert_eq!(ceiling_power_of_two(2), 2);
        assert_eq!(ceiling_power_of_two(3), 4);
        assert_eq!(ceiling_power_of_two(129), 256);
        assert_eq!(ceiling_power_of_two(512), 512);
    }

    #[test]
    fn shelf_packer_keeps_glyphs_inside_and_disjoint() {
        let atlas_size = 256;
        let padding = 2;
        let mut atlas = AtlasTexture::new(0, atlas_size);

        let sizes = [
            (10, 12),
            (30, 8),
            (5, 20),
            (60, 60),
            (7, 7),
            (100, 30),
            (12, 40),
        ];
        let mut placed: Vec<(u32, u32, u32, u32)> = Vec::new();
        for (w, h) in sizes.iter() {
            let (x, y) = atlas.reserve(*w, *h, padding, atlas_size).unwrap();
            // Fully inside the atlas.
            assert!(x + w <= atlas_size);
            assert!(y + h <= atlas_size);
            // Disjoint from everything placed before.
            for (px, py, pw, ph) in placed.iter() {
                let overlap_x = x < px + pw && *px < x + w;
                let overlap_y = y < py + ph && *py < y + h;
                assert!(!(overlap_x && overlap_y));
            }
            placed.push((x, y, *w, *h));
        }
    }

    #[test]
    fn shelf_packer_wraps_to_new_rows() {
        let atlas_size = 64;
        let mut atlas = AtlasTexture::new(0, atlas_size);
        let first = atlas.reserve(40, 10, 1, atlas_size).unwrap();
        let second = atlas.reserve(40, 10, 1, atlas_size).unwrap();
        // The second glyph cannot share the 64 wide row with the
        // first, it must be on a lower shelf.
        assert!(second.1 > first.1);
    }

    #[test]
    fn shelf_packer_rejects_oversized_glyphs() {
        let atlas_size = 64;
        let mut atlas = AtlasTexture::new(0, atlas_size);
        assert!(atlas.reserve(100, 10, 1, atlas_size).is_none());
        assert!(atlas.reserve(10, 100, 1, atlas_size).is_none());
    }

    #[test]
    fn full_atlas_reports_out_of_room() {
        let atlas_size = 32;
        let mut atlas = AtlasTexture::new(0, atlas_size);
        let mut reserved = 0;
        while atlas.reserve(10, 10, 1, atlas_size).is_some() {
            reserved += 1;
            assert!(reserved < 100);
        }
        assert!(reserved > 0);
    }
}
