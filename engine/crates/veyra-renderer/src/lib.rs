pub mod culling;
pub mod frustum;
pub mod pipelines;
pub mod render_scene;
pub mod renderer;
pub mod shader_layout;
