use kube::CustomResourceExt;
use stove8s::crd::SnapShot;

fn main() {
    print!("{}", serde_yaml::to_string(&SnapShot::crd()).unwrap());
}
