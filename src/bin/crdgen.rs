use kube::CustomResourceExt;
use stack_operator::crd::Stack;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Stack::crd())?);
    Ok(())
}
