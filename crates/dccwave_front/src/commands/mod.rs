pub mod blocks;
pub mod events;
pub mod packet;
pub mod run;
pub mod timing;
