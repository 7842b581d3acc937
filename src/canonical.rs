use crate::stub::StubRecord;

/// Rewrites a stub before it is persisted, e.g. to scrub secrets or pin volatile fields.
///
/// Implementations should keep `request.url` and `request.method` unless they mean to change
/// which requests the stub answers.
pub trait StubTransform: Send + Sync {
    fn transform(&self, stub: StubRecord) -> StubRecord;
}

impl<F> StubTransform for F
where
    F: Fn(StubRecord) -> StubRecord + Send + Sync,
{
    fn transform(&self, stub: StubRecord) -> StubRecord {
        self(stub)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl StubTransform for IdentityTransform {
    fn transform(&self, stub: StubRecord) -> StubRecord {
        stub
    }
}

/// Applies `transform` to every stub, then orders the collection by `url + METHOD` using
/// byte-wise comparison. The sort is stable.
pub fn canonicalize(stubs: Vec<StubRecord>, transform: &dyn StubTransform) -> Vec<StubRecord> {
    let mut keyed: Vec<(String, StubRecord)> = stubs
        .into_iter()
        .map(|stub| transform.transform(stub))
        .map(|stub| (stub.sort_key(), stub))
        .collect();
    keyed.sort_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));
    keyed.into_iter().map(|(_, stub)| stub).collect()
}
