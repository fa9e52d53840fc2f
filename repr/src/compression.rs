#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Id(pub u16);

impl Id {
    pub const GZIP: Id = Id(1);
    pub const ZSTD: Id = Id(2);

    pub const MAX: Id = Id::ZSTD;
}
