mod group;
mod photo;
mod run;

pub use group::GroupRepository;
pub use photo::PhotoRepository;
pub use run::RunRepository;
