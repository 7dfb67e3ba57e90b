use kube::CustomResourceExt;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&sandbox_operator::resources::sandboxes::Sandbox::crd()).unwrap()
    )
}
