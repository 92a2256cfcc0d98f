// Mesh primitives
//
// The Vertex layout here must match the std430 Vertex struct in the
// shaders, the mesh buffer uploads these bytes verbatim into storage
// buffers.

use cgmath::Vector2;

use crate::resource::font::FontResource;
use crate::resource::Resource;
use crate::{Result, SquallError};

/// RGBA color, floating point channels in [0, 1].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const WHITE: Color = Color::new(1.0, 1.0, 1.0, 1.0);
    pub const BLACK: Color = Color::new(0.0, 0.0, 0.0, 1.0);
    pub const TRANSPARENT: Color = Color::new(0.0, 0.0, 0.0, 0.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Color {
        Color { r, g, b, a }
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::WHITE
    }
}

/// RGBA color with 8 bit channels, the texel format of textures and
/// glyph atlases.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Color8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color8 {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Color8 {
        Color8 { r, g, b, a }
    }
}

/// Axis aligned rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect2 {
    pub top_left: Vector2<f32>,
    pub bottom_right: Vector2<f32>,
}

impl Rect2 {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Rect2 {
        Rect2 {
            top_left: Vector2::new(left, top),
            bottom_right: Vector2::new(right, bottom),
        }
    }

    pub fn width(&self) -> f32 {
        self.bottom_right.x - self.top_left.x
    }

    pub fn height(&self) -> f32 {
        self.bottom_right.y - self.top_left.y
    }
}

/// One vertex as the shaders see it. Layout is std430: the color must
/// start on a 16 byte boundary and the struct size must be a multiple
/// of 16, hence the trailing pad.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub vertex_coords: Vector2<f32>,
    pub uv_coords: Vector2<f32>,
    pub color: Color,
    pub point_size: f32,
    /// Texture array layer sampled when the mesh carries no per-vertex
    /// layer weights.
    pub single_texture_layer: u32,
    _pad: [u32; 2],
}

impl Vertex {
    pub fn new(coords: Vector2<f32>, uv: Vector2<f32>, color: Color) -> Vertex {
        Vertex {
            vertex_coords: coords,
            uv_coords: uv,
            color,
            point_size: 1.0,
            single_texture_layer: 0,
            _pad: [0; 2],
        }
    }
}

impl Default for Vertex {
    fn default() -> Self {
        Vertex::new(
            Vector2::new(0.0, 0.0),
            Vector2::new(0.0, 0.0),
            Color::WHITE,
        )
    }
}

/// How a mesh's indices are to be interpreted when drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshType {
    TriangleFilled,
    TriangleWireframe,
    Line,
    Point,
}

/// Geometry the caller hands to the draw calls: vertices, indices and
/// optional per-vertex texture layer weights.
///
/// Transform operations work on the CPU side; composing transform
/// matrices beyond that is left to the caller.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    /// `layer_count` weights per vertex when multitextured, empty
    /// otherwise.
    pub texture_layer_weights: Vec<f32>,
    pub mesh_type: MeshType,
    pub line_width: f32,
    pub aabb: Rect2,
}

impl Mesh {
    pub fn new(mesh_type: MeshType) -> Mesh {
        Mesh {
            vertices: Vec::new(),
            indices: Vec::new(),
            texture_layer_weights: Vec::new(),
            mesh_type,
            line_width: 1.0,
            aabb: Rect2::default(),
        }
    }

    /// Move every vertex by `offset`.
    pub fn translate(&mut self, offset: Vector2<f32>) {
        for v in self.vertices.iter_mut() {
            v.vertex_coords += offset;
        }
        self.aabb.top_left += offset;
        self.aabb.bottom_right += offset;
    }

    /// Rotate every vertex by `angle` radians around `origin`.
    pub fn rotate(&mut self, angle: f32, origin: Vector2<f32>) {
        let (sin, cos) = angle.sin_cos();
        for v in self.vertices.iter_mut() {
            let p = v.vertex_coords - origin;
            v.vertex_coords =
                Vector2::new(p.x * cos - p.y * sin, p.x * sin + p.y * cos) + origin;
        }
        self.recalculate_aabb_from_vertices();
    }

    /// Scale every vertex away from `origin`.
    pub fn scale(&mut self, factor: Vector2<f32>, origin: Vector2<f32>) {
        for v in self.vertices.iter_mut() {
            let p = v.vertex_coords - origin;
            v.vertex_coords = Vector2::new(p.x * factor.x, p.y * factor.y) + origin;
        }
        self.recalculate_aabb_from_vertices();
    }

    pub fn set_vertex_color(&mut self, color: Color) {
        for v in self.vertices.iter_mut() {
            v.color = color;
        }
    }

    /// Recompute the bounding box from the vertex positions.
    pub fn recalculate_aabb_from_vertices(&mut self) -> Rect2 {
        let mut aabb = match self.vertices.first() {
            Some(v) => Rect2 {
                top_left: v.vertex_coords,
                bottom_right: v.vertex_coords,
            },
            None => Rect2::default(),
        };
        for v in self.vertices.iter().skip(1) {
            aabb.top_left.x = aabb.top_left.x.min(v.vertex_coords.x);
            aabb.top_left.y = aabb.top_left.y.min(v.vertex_coords.y);
            aabb.bottom_right.x = aabb.bottom_right.x.max(v.vertex_coords.x);
            aabb.bottom_right.y = aabb.bottom_right.y.max(v.vertex_coords.y);
        }
        self.aabb = aabb;
        aabb
    }
}

/// An axis aligned rectangle as two triangles, UVs spanning [0, 1].
pub fn rectangle_mesh(area: Rect2, filled: bool) -> Mesh {
    let mut mesh = Mesh::new(if filled {
        MeshType::TriangleFilled
    } else {
        MeshType::TriangleWireframe
    });

    mesh.vertices = vec![
        Vertex::new(area.top_left, Vector2::new(0.0, 0.0), Color::WHITE),
        Vertex::new(
            Vector2::new(area.bottom_right.x, area.top_left.y),
            Vector2::new(1.0, 0.0),
            Color::WHITE,
        ),
        Vertex::new(
            Vector2::new(area.top_left.x, area.bottom_right.y),
            Vector2::new(0.0, 1.0),
            Color::WHITE,
        ),
        Vertex::new(area.bottom_right, Vector2::new(1.0, 1.0), Color::WHITE),
    ];
    mesh.indices = vec![0, 1, 2, 2, 1, 3];
    mesh.aabb = area;
    mesh
}

/// Lay `text` out horizontally with `font`, one quad per character.
///
/// The pen starts at `origin`; each glyph contributes four vertices
/// and six indices, positioned from its horizontal coordinate rect
/// and advanced by its horizontal advance. The font must be loaded.
pub fn text_mesh(
    font: &FontResource,
    face_index: u32,
    text: &str,
    origin: Vector2<f32>,
) -> Result<Mesh> {
    if font.status() != crate::ResourceStatus::Loaded {
        return Err(SquallError::RESOURCE_NOT_LOADED);
    }

    let mut mesh = Mesh::new(MeshType::TriangleFilled);
    let mut pen = origin;

    for ch in text.chars() {
        let glyph = font.glyph_info(face_index, ch)?;

        let base = mesh.vertices.len() as u32;
        let rect = glyph.horizontal_coords;
        let uv = glyph.uv_coords;
        let layer = glyph.atlas_index;

        let corners = [
            (rect.top_left, uv.top_left),
            (
                Vector2::new(rect.bottom_right.x, rect.top_left.y),
                Vector2::new(uv.bottom_right.x, uv.top_left.y),
            ),
            (
                Vector2::new(rect.top_left.x, rect.bottom_right.y),
                Vector2::new(uv.top_left.x, uv.bottom_right.y),
            ),
            (rect.bottom_right, uv.bottom_right),
        ];
        for (pos, uv) in corners.iter() {
            let mut v = Vertex::new(pen + *pos, *uv, Color::WHITE);
            v.single_texture_layer = layer;
            mesh.vertices.push(v);
        }
        mesh.indices.extend_from_slice(&[
            base,
            base + 1,
            base + 2,
            base + 2,
            base + 1,
            base + 3,
        ]);

        pen.x += glyph.horizontal_advance;
    }

    mesh.recalculate_aabb_from_vertices();
    Ok(mesh)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-5;

    fn square() -> Mesh {
        rectangle_mesh(Rect2::new(10.0, 20.0, 30.0, 40.0), true)
    }

    fn assert_positions_eq(a: &Mesh, b: &Mesh) {
        assert_eq!(a.vertices.len(), b.vertices.len());
        for (va, vb) in a.vertices.iter().zip(b.vertices.iter()) {
            assert!((va.vertex_coords.x - vb.vertex_coords.x).abs() < EPS);
            assert!((va.vertex_coords.y - vb.vertex_coords.y).abs() < EPS);
        }
    }

    #[test]
    fn vertex_layout_is_std430() {
        // The shaders index a Vertex[] storage buffer with this exact
        // stride and field placement.
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
        assert_eq!(std::mem::align_of::<Vertex>() % 4, 0);
    }

    #[test]
    fn translate_round_trip_restores_positions() {
        let original = square();
        let mut mesh = original.clone();
        mesh.translate(Vector2::new(13.5, -7.25));
        mesh.translate(Vector2::new(-13.5, 7.25));
        assert_positions_eq(&original, &mesh);
    }

    #[test]
    fn rotate_round_trip_restores_positions() {
        let original = square();
        let mut mesh = original.clone();
        let origin = Vector2::new(3.0, -1.0);
        mesh.rotate(0.7, origin);
        mesh.rotate(-0.7, origin);
        assert_positions_eq(&original, &mesh);
    }

    #[test]
    fn set_vertex_color_leaves_aabb_unchanged() {
        let mut mesh = square();
        let before = mesh.aabb;
        mesh.set_vertex_color(Color::new(0.2, 0.4, 0.6, 1.0));
        let after = mesh.recalculate_aabb_from_vertices();
        assert_eq!(before, after);
    }

    #[test]
    fn rectangle_mesh_shape() {
        let mesh = square();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices.len(), 6);
        assert_eq!(mesh.aabb, Rect2::new(10.0, 20.0, 30.0, 40.0));
    }

    #[test]
    fn aabb_follows_vertices() {
        let mut mesh = square();
        mesh.translate(Vector2::new(5.0, 5.0));
        assert_eq!(mesh.aabb, Rect2::new(15.0, 25.0, 35.0, 45.0));
        let recomputed = mesh.recalculate_aabb_from_vertices();
        assert_eq!(mesh.aabb, recomputed);
    }
}
