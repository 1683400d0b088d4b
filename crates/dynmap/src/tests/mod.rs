mod helpers;

mod lifecycle;
