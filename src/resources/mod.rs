pub mod sandboxes;
