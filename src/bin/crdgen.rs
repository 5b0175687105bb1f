use kube::CustomResourceExt;
use nvmesh_operator::crd::NVMesh;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&NVMesh::crd())?);
    Ok(())
}
