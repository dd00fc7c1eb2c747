pub mod tm;
