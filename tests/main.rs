// Squall end to end tests
//
// These exercise the real device: they need a vulkan implementation
// and a display, so they are ignored by default. Run them locally
// with `cargo test -- --ignored`.

use squall as sq;
use squall::cgmath;
use squall::Resource;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn init_instance() -> (sq::Instance, Arc<AtomicUsize>) {
    let error_count = Arc::new(AtomicUsize::new(0));
    let errors = error_count.clone();
    let info = sq::InstanceCreateInfo {
        application_name: "squall-tests".into(),
        report_callback: Some(Box::new(move |severity, message| {
            if severity >= sq::ReportSeverity::NonCriticalError {
                eprintln!("[{:?}] {}", severity, message);
                errors.fetch_add(1, Ordering::SeqCst);
            }
        })),
        ..Default::default()
    };
    (sq::Instance::new(info).unwrap(), error_count)
}

fn small_window(instance: &sq::Instance, size: (u32, u32)) -> sq::Window {
    instance
        .create_output_window(sq::WindowCreateInfo {
            size,
            title: "squall test".into(),
            visible: false,
            ..Default::default()
        })
        .unwrap()
}

/// Write a small test png to a temp path.
fn write_test_png(size: u32) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("squall-test-{}.png", size));
    let mut img = image::RgbaImage::new(size, size);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        *pixel = image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255]);
    }
    img.save(&path).unwrap();
    path
}

#[test]
#[ignore = "requires a vulkan device and a display"]
fn sixty_clear_frames() {
    let (instance, errors) = init_instance();
    let mut window = small_window(&instance, (800, 600));

    for _ in 0..60 {
        window.begin_render().unwrap();
        window.end_render().unwrap();
    }

    assert_eq!(errors.load(Ordering::SeqCst), 0);
    instance.destroy_output_window(window);
}

#[test]
#[ignore = "requires a vulkan device and a display"]
fn textured_rectangle_draw() {
    let (instance, errors) = init_instance();
    let mut window = small_window(&instance, (640, 480));

    let path = write_test_png(256);
    let texture = instance
        .get_resource_manager()
        .load_texture(vec![path])
        .unwrap();
    assert_eq!(texture.wait_until_loaded(None), sq::ResourceStatus::Loaded);
    // 256x256 -> floor(log2(256)) + 1 mip levels.
    assert_eq!(texture.mip_level_count(), 9);
    assert_eq!(texture.layer_count(), 1);

    let mesh = sq::rectangle_mesh(sq::Rect2::new(-100.0, -100.0, 100.0, 100.0), true);
    window.begin_render().unwrap();
    window
        .draw_mesh(&mesh, Some(texture.as_ref()), None)
        .unwrap();
    window.end_render().unwrap();

    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

#[test]
#[ignore = "requires a vulkan device, a display and a system font"]
fn text_mesh_layout() {
    let font_path = ["/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"]
        .iter()
        .map(std::path::PathBuf::from)
        .find(|p| p.exists())
        .expect("no test font available");

    let (instance, _errors) = init_instance();
    let font = instance
        .get_resource_manager()
        .load_font(
            font_path,
            sq::FontCreateInfo {
                glyph_texel_size: 32,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(font.wait_until_loaded(None), sq::ResourceStatus::Loaded);

    let mesh = sq::text_mesh(&font, 0, "abcABC", cgmath::Vector2::new(0.0, 0.0)).unwrap();

    // Six characters, one quad each.
    assert_eq!(mesh.vertices.len(), 24);
    assert_eq!(mesh.indices.len(), 36);
    for v in mesh.vertices.iter() {
        assert!((0.0..=1.0).contains(&v.uv_coords.x));
        assert!((0.0..=1.0).contains(&v.uv_coords.y));
    }

    // The advances must carry the pen to the right edge of the last
    // glyph within one texel.
    let advance_sum: f32 = "abcABC"
        .chars()
        .map(|c| font.glyph_info(0, c).unwrap().horizontal_advance)
        .sum();
    let last = font.glyph_info(0, 'C').unwrap();
    let pen_before_last: f32 = "abcAB"
        .chars()
        .map(|c| font.glyph_info(0, c).unwrap().horizontal_advance)
        .sum();
    let last_right_edge = pen_before_last + last.horizontal_coords.bottom_right.x;
    assert!(advance_sum >= last_right_edge - 1.0);
}

#[test]
#[ignore = "requires a vulkan device and a display"]
fn render_target_sampled_by_window() {
    let (instance, errors) = init_instance();
    let mut window = small_window(&instance, (640, 480));

    let target = instance
        .create_render_target_texture(sq::RenderTargetTextureCreateInfo {
            size: (512, 512),
            ..Default::default()
        })
        .unwrap();

    // One triangle into the target.
    let mut triangle = sq::Mesh::new(sq::MeshType::TriangleFilled);
    triangle.vertices = vec![
        sq::Vertex::new(
            cgmath::Vector2::new(0.0, -100.0),
            cgmath::Vector2::new(0.5, 0.0),
            sq::Color::WHITE,
        ),
        sq::Vertex::new(
            cgmath::Vector2::new(-100.0, 100.0),
            cgmath::Vector2::new(0.0, 1.0),
            sq::Color::WHITE,
        ),
        sq::Vertex::new(
            cgmath::Vector2::new(100.0, 100.0),
            cgmath::Vector2::new(1.0, 1.0),
            sq::Color::WHITE,
        ),
    ];
    triangle.indices = vec![0, 1, 2];

    target.begin_render().unwrap();
    target.draw_mesh(&triangle, None, None).unwrap();
    target.end_render(None).unwrap();

    // Sample the target onto the window; end_render must chain the
    // target's submission ahead of the window's.
    let quad = sq::rectangle_mesh(sq::Rect2::new(-200.0, -200.0, 200.0, 200.0), true);
    window.begin_render().unwrap();
    window
        .draw_mesh(&quad, Some(target.as_ref() as &dyn sq::Texture), None)
        .unwrap();
    window.end_render().unwrap();

    assert_eq!(errors.load(Ordering::SeqCst), 0);
    instance.destroy_render_target_texture(target);
    instance.destroy_output_window(window);
}

#[test]
#[ignore = "requires a vulkan device and a display"]
fn window_resize_recreates_swapchain() {
    let (instance, errors) = init_instance();
    let mut window = small_window(&instance, (800, 600));

    window.begin_render().unwrap();
    window.end_render().unwrap();

    window.set_size((1024, 768));
    for _ in 0..3 {
        instance.run();
        window.begin_render().unwrap();
        window.end_render().unwrap();
    }

    assert_eq!(window.size(), (1024, 768));
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

#[test]
#[ignore = "requires a vulkan device"]
fn blurred_render_target() {
    let (instance, errors) = init_instance();
    let mut window = small_window(&instance, (320, 240));

    let target = instance
        .create_render_target_texture(sq::RenderTargetTextureCreateInfo {
            size: (256, 256),
            enable_blur: true,
            ..Default::default()
        })
        .unwrap();

    let quad = sq::rectangle_mesh(sq::Rect2::new(-50.0, -50.0, 50.0, 50.0), true);
    target.begin_render().unwrap();
    target.draw_mesh(&quad, None, None).unwrap();
    target
        .end_render(Some((sq::BlurType::Gaussian, 4.0)))
        .unwrap();

    window.begin_render().unwrap();
    window
        .draw_mesh(&quad, Some(target.as_ref() as &dyn sq::Texture), None)
        .unwrap();
    window.end_render().unwrap();

    assert_eq!(errors.load(Ordering::SeqCst), 0);
}
