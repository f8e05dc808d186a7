pub mod compress;
pub mod convert;
pub mod converter;
pub mod epoch;
pub mod fetch;
pub mod files;
pub mod ledger;
pub mod lock;
pub mod merge;
pub mod site;
pub mod split;
pub mod step;
pub mod store;
pub mod tag;
pub mod translate;
pub mod warn;
