pub mod app;
pub mod controller;
pub mod shaper;

pub use app::{Account, AppContext, AppError, Application, TransferUser, User, new_application};
pub use controller::AppController;
pub use shaper::{
    AutoShaper, ConstantShaper, LoadInfo, Shaper, SlopeShaper, WaveShaper, from_rate,
};
