pub mod abstract_device;
pub mod calibration;
pub mod calibration_run;
pub mod control_device;
pub mod events;
pub mod guide_loop;
pub mod guide_session;
pub mod star_locator;
pub mod tracker;
pub mod value_stats;
