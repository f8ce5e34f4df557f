use crate::util::Target;

pub async fn run(target: &Target) -> i32 {
    target.get("/health", &[]).await
}
